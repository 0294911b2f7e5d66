use crate::{
    event::{
        TOPIC_CALL_CONTRACT, TOPIC_CANDIDATE, TOPIC_DELEGATE, TOPIC_DEPLOY_CONTRACT,
        TOPIC_SEND_TRANSACTION,
    },
    serializer::{Reader, ReaderError, Serializer, Writer},
};
use serde::{Deserialize, Serialize};

// What a delegate payload asks the vote trie to do
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DelegateAction {
    Delegate,
    Undelegate,
}

// What a candidate payload asks the candidate trie to do
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CandidateAction {
    Register,
    Withdraw,
}

// This enum represents all types of transaction available on the chain.
// Each variant carries its own decoded fields; the post-commit event
// topic is a total function of the variant.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    // Plain value transfer with an opaque memo
    Binary {
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },
    // Deploy a contract, executed by the VM collaborator
    Deploy {
        source: String,
        args: String,
    },
    // Call a deployed contract
    Call {
        function: String,
        args: String,
    },
    // Vote for a delegate
    Delegate {
        action: DelegateAction,
        delegatee: String,
    },
    // Register or withdraw as a candidate
    Candidate {
        action: CandidateAction,
    },
}

impl Payload {
    // Topic published for this transaction once its block commits
    pub fn topic(&self) -> &'static str {
        match self {
            Payload::Binary { .. } => TOPIC_SEND_TRANSACTION,
            Payload::Deploy { .. } => TOPIC_DEPLOY_CONTRACT,
            Payload::Call { .. } => TOPIC_CALL_CONTRACT,
            Payload::Delegate { .. } => TOPIC_DELEGATE,
            Payload::Candidate { .. } => TOPIC_CANDIDATE,
        }
    }
}

impl Serializer for Payload {
    fn write(&self, writer: &mut Writer) {
        match self {
            Payload::Binary { data } => {
                writer.write_u8(0);
                writer.write_var_bytes(data);
            }
            Payload::Deploy { source, args } => {
                writer.write_u8(1);
                writer.write_var_bytes(source.as_bytes());
                writer.write_var_bytes(args.as_bytes());
            }
            Payload::Call { function, args } => {
                writer.write_u8(2);
                writer.write_var_bytes(function.as_bytes());
                writer.write_var_bytes(args.as_bytes());
            }
            Payload::Delegate { action, delegatee } => {
                writer.write_u8(3);
                writer.write_u8(match action {
                    DelegateAction::Delegate => 0,
                    DelegateAction::Undelegate => 1,
                });
                writer.write_var_bytes(delegatee.as_bytes());
            }
            Payload::Candidate { action } => {
                writer.write_u8(4);
                writer.write_u8(match action {
                    CandidateAction::Register => 0,
                    CandidateAction::Withdraw => 1,
                });
            }
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let payload = match reader.read_u8()? {
            0 => Payload::Binary {
                data: reader.read_var_bytes()?,
            },
            1 => Payload::Deploy {
                source: read_var_string(reader)?,
                args: read_var_string(reader)?,
            },
            2 => Payload::Call {
                function: read_var_string(reader)?,
                args: read_var_string(reader)?,
            },
            3 => Payload::Delegate {
                action: match reader.read_u8()? {
                    0 => DelegateAction::Delegate,
                    1 => DelegateAction::Undelegate,
                    _ => return Err(ReaderError::InvalidValue),
                },
                delegatee: read_var_string(reader)?,
            },
            4 => Payload::Candidate {
                action: match reader.read_u8()? {
                    0 => CandidateAction::Register,
                    1 => CandidateAction::Withdraw,
                    _ => return Err(ReaderError::InvalidValue),
                },
            },
            _ => return Err(ReaderError::InvalidValue),
        };
        Ok(payload)
    }
}

fn read_var_string(reader: &mut Reader) -> Result<String, ReaderError> {
    String::from_utf8(reader.read_var_bytes()?).map_err(|_| ReaderError::InvalidString)
}

// Serialize opaque payload data as hex in JSON forms
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let hex = String::deserialize(d)?;
        hex::decode(hex).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TOPIC_DELEGATE;

    #[test]
    fn test_topic_is_total_over_variants() {
        let payload = Payload::Delegate {
            action: DelegateAction::Delegate,
            delegatee: "n1abc".to_string(),
        };
        assert_eq!(payload.topic(), TOPIC_DELEGATE);
        assert_eq!(
            Payload::Binary { data: vec![] }.topic(),
            super::TOPIC_SEND_TRANSACTION
        );
    }

    #[test]
    fn test_payload_rejects_unknown_tag() {
        assert!(Payload::from_bytes(&[9]).is_err());
    }

    #[test]
    fn test_call_payload_roundtrip() {
        let payload = Payload::Call {
            function: "transfer".to_string(),
            args: "[\"n1abc\",\"10\"]".to_string(),
        };
        let decoded = Payload::from_bytes(&payload.to_bytes()).unwrap();
        assert_eq!(payload, decoded);
    }
}
