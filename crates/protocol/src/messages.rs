use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ProtocolError;
use crate::part::num_fingerprints;
use crate::types::{RecipientId, TransferId, TransferKey};

/// Everything a receiver needs to pick up a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLink {
    #[serde(rename = "fileID")]
    pub file_id: TransferId,
    #[serde(rename = "recipientID")]
    pub recipient_id: RecipientId,
    pub sent_timestamp: DateTime<Utc>,
    #[serde(rename = "transferKey")]
    pub key: TransferKey,
    /// MAC over the whole file, keyed by the transfer key.
    #[serde(with = "base64_bytes")]
    pub mac: Vec<u8>,
    pub size: u32,
    pub num_parts: u16,
    pub retry: f32,
}

impl FileLink {
    /// Fingerprint budget implied by the part count and retry factor.
    pub fn num_fingerprints(&self) -> u16 {
        num_fingerprints(self.num_parts, self.retry)
    }
}

/// Handshake message the sender shares with its peer out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_name: String,
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
    pub preview: Vec<u8>,
    pub file_link: FileLink,
}

impl FileInfo {
    pub fn marshal(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Byte fields travel as base64 strings.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ID_LEN;

    fn sample_link() -> FileLink {
        FileLink {
            file_id: TransferId::from_file(b"contents"),
            recipient_id: RecipientId::new([2; ID_LEN]),
            sent_timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            key: TransferKey::new([3; ID_LEN]),
            mac: vec![9; 32],
            size: 8,
            num_parts: 1,
            retry: 0.5,
        }
    }

    #[test]
    fn file_info_uses_wire_field_names() {
        let info = FileInfo {
            file_name: "notes.txt".into(),
            file_type: "txt".into(),
            preview: vec![1, 2, 3],
            file_link: sample_link(),
        };
        let json: serde_json::Value = serde_json::from_slice(&info.marshal().unwrap()).unwrap();

        assert_eq!(json["fileName"], "notes.txt");
        assert_eq!(json["preview"], "AQID");
        let link = &json["fileLink"];
        assert!(link.get("fileID").is_some());
        assert!(link.get("recipientID").is_some());
        assert!(link.get("transferKey").is_some());
        assert_eq!(link["numParts"], 1);
    }

    #[test]
    fn file_info_survives_marshal() {
        let info = FileInfo {
            file_name: "a".into(),
            file_type: String::new(),
            preview: Vec::new(),
            file_link: sample_link(),
        };
        let bytes = info.marshal().unwrap();
        // Empty previews are omitted entirely.
        assert!(!String::from_utf8_lossy(&bytes).contains("preview"));
        assert_eq!(FileInfo::unmarshal(&bytes).unwrap(), info);
    }

    #[test]
    fn unmarshal_rejects_garbage() {
        assert!(matches!(
            FileInfo::unmarshal(b"{not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn link_reports_fingerprint_budget() {
        let mut link = sample_link();
        link.num_parts = 10;
        assert_eq!(link.num_fingerprints(), 15);
    }
}
