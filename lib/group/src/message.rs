// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Position of a message within its operator's chunk sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    pub index: u64,
    pub is_last: bool,
}

impl ChunkHeader {
    pub const SINGLE: ChunkHeader = ChunkHeader {
        index: 0,
        is_last: true,
    };
}

/// Envelope for all operator traffic between two tasks of a group.
///
/// `payload` holds the operator codec's encoding of one chunk; the
/// envelope itself travels with the group's JSON codec. `epoch` is the
/// sender's placement epoch; receivers discard anything from an older one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub group: String,
    #[serde(default)]
    pub epoch: u64,
    pub operator: String,
    pub source: String,
    pub destination: String,
    pub chunk: ChunkHeader,
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
}

/// Payload bytes as standard base64 rather than a JSON number array.
mod payload_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(|e| D::Error::custom(format!("invalid base64 payload: {e}")))
    }
}
