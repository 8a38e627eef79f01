//! Typed instruction envelope.
//!
//! The wire `instruction` packet carries an untyped `data` map keyed by
//! action name (`m2m.py`'s `on_instruction`, dispatching on `data['action']`
//! with ad hoc per-action fields). We parse that map once, at the boundary,
//! into this tagged union so the rest of the agent never touches the raw
//! bencode map directly.

use crate::bencode::Value;
use std::collections::BTreeMap;

use crate::pty::WindowSize;

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Sync,
    OpenTerminal {
        name: String,
        port: i64,
        size: Option<WindowSize>,
    },
    OpenKeyboard {
        name: String,
        port: i64,
    },
    OpenButtons {
        name: String,
        port: i64,
    },
    OpenEcho {
        port: i64,
    },
    OpenPortforward {
        service: String,
        route: [i64; 4],
    },
    RebootDevice,
    /// An action this agent doesn't recognize. Logged and dropped by the
    /// caller rather than treated as an error.
    Unknown {
        action: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum InstructionError {
    #[error("instruction data is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("instruction is missing the 'action' field")]
    MissingAction,
    #[error("field '{0}' has the wrong type")]
    WrongType(&'static str),
}

impl Instruction {
    pub fn parse(data: &BTreeMap<Vec<u8>, Value>) -> Result<Instruction, InstructionError> {
        let action = get_str(data, "action").ok_or(InstructionError::MissingAction)?;

        Ok(match action.as_str() {
            "sync" => Instruction::Sync,
            "open-terminal" => Instruction::OpenTerminal {
                name: require_str(data, "name")?,
                port: require_int(data, "port")?,
                size: get_size(data),
            },
            "open-keyboard" => Instruction::OpenKeyboard {
                name: require_str(data, "name")?,
                port: require_int(data, "port")?,
            },
            "open-buttons" => Instruction::OpenButtons {
                name: require_str(data, "name")?,
                port: require_int(data, "port")?,
            },
            "open-echo" => Instruction::OpenEcho {
                port: require_int(data, "port")?,
            },
            "open-portforward" => Instruction::OpenPortforward {
                service: require_str(data, "service")?,
                route: require_route(data)?,
            },
            "reboot-device" => Instruction::RebootDevice,
            other => Instruction::Unknown {
                action: other.to_string(),
            },
        })
    }
}

fn get_str(data: &BTreeMap<Vec<u8>, Value>, key: &str) -> Option<String> {
    data.get(key.as_bytes())
        .and_then(Value::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
}

fn require_str(data: &BTreeMap<Vec<u8>, Value>, key: &'static str) -> Result<String, InstructionError> {
    get_str(data, key).ok_or(InstructionError::MissingField(key))
}

fn require_int(data: &BTreeMap<Vec<u8>, Value>, key: &'static str) -> Result<i64, InstructionError> {
    data.get(key.as_bytes())
        .and_then(Value::as_int)
        .ok_or(InstructionError::MissingField(key))
}

fn get_size(data: &BTreeMap<Vec<u8>, Value>) -> Option<WindowSize> {
    let list = data.get(b"size".as_slice())?.as_list()?;
    let cols = list.first()?.as_int()?;
    let rows = list.get(1)?.as_int()?;
    Some(WindowSize {
        cols: cols as u16,
        rows: rows as u16,
    })
}

fn require_route(data: &BTreeMap<Vec<u8>, Value>) -> Result<[i64; 4], InstructionError> {
    let list = data
        .get(b"route".as_slice())
        .and_then(Value::as_list)
        .ok_or(InstructionError::MissingField("route"))?;
    if list.len() != 4 {
        return Err(InstructionError::WrongType("route"));
    }
    let mut route = [0i64; 4];
    for (i, value) in list.iter().enumerate() {
        route[i] = value.as_int().ok_or(InstructionError::WrongType("route"))?;
    }
    Ok(route)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, Value)]) -> BTreeMap<Vec<u8>, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.clone()))
            .collect()
    }

    #[test]
    fn parses_sync() {
        let data = map(&[("action", Value::from("sync"))]);
        assert_eq!(Instruction::parse(&data).unwrap(), Instruction::Sync);
    }

    #[test]
    fn parses_open_terminal_with_size() {
        let data = map(&[
            ("action", Value::from("open-terminal")),
            ("name", Value::from("console")),
            ("port", Value::Int(10)),
            ("size", Value::List(vec![Value::Int(100), Value::Int(30)])),
        ]);
        assert_eq!(
            Instruction::parse(&data).unwrap(),
            Instruction::OpenTerminal {
                name: "console".into(),
                port: 10,
                size: Some(WindowSize { cols: 100, rows: 30 }),
            }
        );
    }

    #[test]
    fn parses_open_terminal_without_size() {
        let data = map(&[
            ("action", Value::from("open-terminal")),
            ("name", Value::from("console")),
            ("port", Value::Int(10)),
        ]);
        assert_eq!(
            Instruction::parse(&data).unwrap(),
            Instruction::OpenTerminal {
                name: "console".into(),
                port: 10,
                size: None,
            }
        );
    }

    #[test]
    fn parses_open_portforward() {
        let data = map(&[
            ("action", Value::from("open-portforward")),
            ("service", Value::from("web")),
            (
                "route",
                Value::List(vec![
                    Value::Int(1),
                    Value::Int(2),
                    Value::Int(3),
                    Value::Int(4),
                ]),
            ),
        ]);
        assert_eq!(
            Instruction::parse(&data).unwrap(),
            Instruction::OpenPortforward {
                service: "web".into(),
                route: [1, 2, 3, 4],
            }
        );
    }

    #[test]
    fn unknown_action_is_preserved_not_rejected() {
        let data = map(&[("action", Value::from("future-feature"))]);
        assert_eq!(
            Instruction::parse(&data).unwrap(),
            Instruction::Unknown {
                action: "future-feature".into()
            }
        );
    }

    #[test]
    fn missing_action_is_an_error() {
        let data = map(&[]);
        assert!(matches!(Instruction::parse(&data), Err(InstructionError::MissingAction)));
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let data = map(&[("action", Value::from("open-terminal"))]);
        assert!(matches!(
            Instruction::parse(&data),
            Err(InstructionError::MissingField("name"))
        ));
    }
}
