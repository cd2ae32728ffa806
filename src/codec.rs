//! The wire format: one message per newline-terminated line of
//! semicolon-separated `key=value` pairs. Keys and values contain no `;`, `=`
//! or newline; pair order is irrelevant on parse.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MemberId;
use crate::core::ProposalNumber;
use crate::messages::Message;

/// Refuse to buffer unbounded garbage from a peer that never sends a newline.
const MAX_LINE: usize = 8 * 1024;

/// Serialize to the line form, including the trailing newline.
///
/// `n` is emitted only where meaningful, `acceptedN`/`acceptedV` only
/// together, `higherN` only on rejects.
#[must_use]
pub fn serialize(message: &Message) -> String {
    let mut line = String::new();
    pair(&mut line, "type", message.kind());
    match message {
        Message::Propose { origin, candidate } => {
            pair(&mut line, "from", origin);
            pair(&mut line, "v", candidate);
        }
        Message::Prepare { from, n } => {
            pair(&mut line, "from", from);
            pair(&mut line, "n", n);
        }
        Message::Promise { from, n, prior } => {
            pair(&mut line, "from", from);
            pair(&mut line, "n", n);
            if let Some((accepted_n, accepted_v)) = prior {
                pair(&mut line, "acceptedN", accepted_n);
                pair(&mut line, "acceptedV", accepted_v);
            }
        }
        Message::Reject { from, higher_n } => {
            pair(&mut line, "from", from);
            pair(&mut line, "higherN", higher_n);
        }
        Message::AcceptRequest { from, n, candidate }
        | Message::Accepted { from, n, candidate } => {
            pair(&mut line, "from", from);
            pair(&mut line, "n", n);
            pair(&mut line, "v", candidate);
        }
        Message::Decide { from, candidate } => {
            pair(&mut line, "from", from);
            pair(&mut line, "v", candidate);
        }
    }
    line.push('\n');
    line
}

fn pair(line: &mut String, key: &str, value: impl std::fmt::Display) {
    if !line.is_empty() {
        line.push(';');
    }
    let _ = write!(line, "{key}={value}");
}

/// Parse one line (with or without the trailing newline).
///
/// # Errors
///
/// Returns [`io::ErrorKind::InvalidData`] on unknown types, missing required
/// keys, or unparseable numbers. Callers log and drop; malformed traffic
/// never crashes a participant.
pub fn parse(line: &str) -> io::Result<Message> {
    let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
    for chunk in line.trim().split(';') {
        if let Some((key, value)) = chunk.split_once('=') {
            fields.insert(key, value);
        }
    }

    let kind = required(&fields, "type")?;
    let from = required(&fields, "from")?;

    match kind {
        "PROPOSE" => Ok(Message::Propose {
            origin: from.to_owned(),
            candidate: required(&fields, "v")?.to_owned(),
        }),
        "PREPARE" => Ok(Message::Prepare {
            from: member(from)?,
            n: number(&fields, "n")?,
        }),
        "PROMISE" => {
            let prior = match (fields.get("acceptedN"), fields.get("acceptedV")) {
                (Some(_), Some(accepted_v)) => {
                    Some((number(&fields, "acceptedN")?, (*accepted_v).to_owned()))
                }
                _ => None,
            };
            Ok(Message::Promise {
                from: member(from)?,
                n: number(&fields, "n")?,
                prior,
            })
        }
        "REJECT" => Ok(Message::Reject {
            from: member(from)?,
            higher_n: number(&fields, "higherN")?,
        }),
        "ACCEPT_REQUEST" => Ok(Message::AcceptRequest {
            from: member(from)?,
            n: number(&fields, "n")?,
            candidate: required(&fields, "v")?.to_owned(),
        }),
        "ACCEPTED" => Ok(Message::Accepted {
            from: member(from)?,
            n: number(&fields, "n")?,
            candidate: required(&fields, "v")?.to_owned(),
        }),
        "DECIDE" => Ok(Message::Decide {
            from: member(from)?,
            candidate: required(&fields, "v")?.to_owned(),
        }),
        other => Err(invalid(format!("unknown message type `{other}`"))),
    }
}

fn required<'a>(fields: &BTreeMap<&str, &'a str>, key: &str) -> io::Result<&'a str> {
    fields
        .get(key)
        .copied()
        .ok_or_else(|| invalid(format!("missing `{key}`")))
}

fn number(fields: &BTreeMap<&str, &str>, key: &str) -> io::Result<ProposalNumber> {
    required(fields, key)?
        .parse()
        .map_err(|_| invalid(format!("`{key}` is not a number")))
}

fn member(s: &str) -> io::Result<MemberId> {
    s.parse()
        .map_err(|_| invalid(format!("`{s}` is not a member id")))
}

fn invalid(reason: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}

/// Frames [`Message`]s over a byte stream, one per line.
#[derive(Clone, Copy, Debug, Default)]
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Message>> {
        let Some(end) = src.iter().position(|&b| b == b'\n') else {
            if src.len() > MAX_LINE {
                return Err(invalid("line too long".to_owned()));
            }
            return Ok(None);
        };
        let frame = src.split_to(end + 1);
        let line = std::str::from_utf8(&frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        parse(line).map(Some)
    }
}

impl Encoder<Message> for WireCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> io::Result<()> {
        dst.extend_from_slice(serialize(&item).as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(k: u8) -> MemberId {
        format!("M{k}").parse().unwrap()
    }

    #[test]
    fn every_arm_survives_a_round_trip() {
        let messages = [
            Message::Propose {
                origin: "script".to_owned(),
                candidate: "M5".to_owned(),
            },
            Message::Prepare { from: m(4), n: 104 },
            Message::Promise {
                from: m(2),
                n: 104,
                prior: None,
            },
            Message::Promise {
                from: m(3),
                n: 104,
                prior: Some((103, "M3".to_owned())),
            },
            Message::Reject {
                from: m(7),
                higher_n: 205,
            },
            Message::AcceptRequest {
                from: m(4),
                n: 104,
                candidate: "M5".to_owned(),
            },
            Message::Accepted {
                from: m(9),
                n: 104,
                candidate: "M5".to_owned(),
            },
            Message::Decide {
                from: m(1),
                candidate: "M5".to_owned(),
            },
        ];
        for message in messages {
            let line = serialize(&message);
            assert!(line.ends_with('\n'));
            assert_eq!(parse(&line).expect("parses"), message);
        }
    }

    #[test]
    fn pair_order_is_irrelevant() {
        let parsed = parse("n=104;v=M5;from=M4;type=ACCEPT_REQUEST").unwrap();
        assert_eq!(
            parsed,
            Message::AcceptRequest {
                from: m(4),
                n: 104,
                candidate: "M5".to_owned(),
            }
        );
    }

    #[test]
    fn prior_accept_requires_both_keys() {
        let parsed = parse("type=PROMISE;from=M2;n=104;acceptedN=103").unwrap();
        assert_eq!(
            parsed,
            Message::Promise {
                from: m(2),
                n: 104,
                prior: None,
            }
        );
    }

    #[test]
    fn optional_keys_are_omitted_on_the_wire() {
        let line = serialize(&Message::Decide {
            from: m(1),
            candidate: "M5".to_owned(),
        });
        assert!(!line.contains("n="));
        let line = serialize(&Message::Promise {
            from: m(2),
            n: 104,
            prior: None,
        });
        assert!(!line.contains("acceptedN"));
        assert!(!line.contains("acceptedV"));
    }

    #[test]
    fn unknown_type_and_missing_fields_are_errors() {
        assert!(parse("type=ELECT;from=M1").is_err());
        assert!(parse("from=M1;n=104").is_err());
        assert!(parse("type=PREPARE;from=M1").is_err());
        assert!(parse("type=PREPARE;from=M12;n=104").is_err());
        assert!(parse("type=PREPARE;from=M1;n=ten").is_err());
    }

    #[test]
    fn decoder_frames_on_newlines() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::from(&b"type=DECIDE;from=M1;v=M5\ntype=PREPARE;from=M2"[..]);
        let first = codec.decode(&mut buf).unwrap();
        assert_eq!(
            first,
            Some(Message::Decide {
                from: m(1),
                candidate: "M5".to_owned(),
            })
        );
        // Second message is incomplete until its newline arrives.
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b";n=201\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::Prepare { from: m(2), n: 201 })
        );
    }
}
