//! Core types for Hot Topics: decoded news records and the raw messages they come from.

use serde::{Deserialize, Serialize};

pub mod news;

pub use news::{Article, ArticleSentiment, SentimentResponse};

/// Event time in milliseconds. Signed so that window starts before the epoch stay representable.
pub type Timestamp = i64;
pub type RecordId = String;
pub type PartitionId = u32;
pub type Offset = u64;

/// Where a raw message was read from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provenance {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: Offset,
}

/// An undecoded message as handed over by the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawMessage {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub timestamp: Timestamp,
    pub provenance: Option<Provenance>,
}

impl RawMessage {
    pub fn new(key: Option<Vec<u8>>, value: Vec<u8>, timestamp: Timestamp) -> Self {
        Self {
            key,
            value,
            timestamp,
            provenance: None,
        }
    }
}

/// Anything carrying an event time the windowing layer can assign.
pub trait Timestamped {
    fn timestamp(&self) -> Timestamp;
}

/// A decoded, immutable news record with its sentiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub timestamp: Timestamp,
    pub payload: ArticleSentiment,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(alias = "article_sentiment")]
    article_sentiment: ArticleSentiment,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, timestamp: Timestamp, payload: ArticleSentiment) -> Self {
        Self {
            id: id.into(),
            timestamp,
            payload,
        }
    }

    /// Decode a transport message. The JSON `id` wins over the message key.
    pub fn decode(message: &RawMessage) -> Result<Self, DecodeError> {
        let wire: WireRecord = serde_json::from_slice(&message.value)?;
        let id = match wire.id {
            Some(id) if !id.is_empty() => id,
            _ => match message.key.as_deref() {
                Some(key) if !key.is_empty() => String::from_utf8(key.to_vec())
                    .map_err(|_| DecodeError::InvalidKey)?,
                _ => return Err(DecodeError::MissingId),
            },
        };

        let sentiment = &wire.article_sentiment.sentiment_response;
        for (field, value) in [("ratio", sentiment.ratio), ("score", sentiment.score)] {
            if !value.is_finite() {
                return Err(DecodeError::NonFinite { field, value });
            }
        }

        Ok(Self {
            id,
            timestamp: message.timestamp,
            payload: wire.article_sentiment,
        })
    }

    pub fn sentiment(&self) -> &SentimentResponse {
        &self.payload.sentiment_response
    }

    pub fn article(&self) -> &Article {
        &self.payload.article
    }
}

impl Timestamped for Record {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Encode a record the way [`Record::decode`] expects it on the wire.
pub fn encode_value(record: &Record) -> Result<Vec<u8>, serde_json::Error> {
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct WireRef<'a> {
        id: &'a str,
        article_sentiment: &'a ArticleSentiment,
    }

    serde_json::to_vec(&WireRef {
        id: &record.id,
        article_sentiment: &record.payload,
    })
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("record has neither an id nor a message key")]
    MissingId,
    #[error("message key is not valid utf-8")]
    InvalidKey,
    #[error("sentiment {field} is not finite: {value}")]
    NonFinite { field: &'static str, value: f64 },
}

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("record at {timestamp} arrived after its windows closed (watermark {watermark})")]
    LateArrival {
        timestamp: Timestamp,
        watermark: Timestamp,
    },
    #[error("invalid window: length {length_ms}ms, slide {slide_ms}ms (need length >= slide > 0)")]
    InvalidWindow { length_ms: i64, slide_ms: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn message(key: Option<&str>, value: &str) -> RawMessage {
        RawMessage::new(key.map(|k| k.as_bytes().to_vec()), value.as_bytes().to_vec(), 1_500)
    }

    #[test]
    fn decodes_camel_case_payload() {
        let value = r#"{
            "id": "news-1",
            "articleSentiment": {
                "article": {
                    "title": "Rates hold",
                    "pubDate": "2024-03-01",
                    "imageUrl": "https://img",
                    "authors": ["A. Writer", "B. Editor"]
                },
                "sentimentResponse": {
                    "ratio": 0.75,
                    "score": 3.0,
                    "type": "positive",
                    "keywords": ["rates", "fed"]
                }
            }
        }"#;
        let record = Record::decode(&message(None, value)).unwrap();
        assert_eq!(record.id, "news-1");
        assert_eq!(record.timestamp, 1_500);
        assert_eq!(record.article().pub_date, "2024-03-01");
        assert_eq!(record.article().image_url, "https://img");
        assert_eq!(record.article().description, "");
        assert_eq!(record.article().authors, vec!["A. Writer", "B. Editor"]);
        assert_eq!(record.sentiment().kind, "positive");
        assert!(record.sentiment().keywords.contains("fed"));
    }

    #[test]
    fn falls_back_to_message_key() {
        let value = r#"{"articleSentiment": {"sentimentResponse": {"ratio": 0.1, "score": 1}}}"#;
        let record = Record::decode(&message(Some("key-7"), value)).unwrap();
        assert_eq!(record.id, "key-7");
    }

    #[test]
    fn rejects_record_without_identity() {
        let value = r#"{"articleSentiment": {"sentimentResponse": {"ratio": 0.1, "score": 1}}}"#;
        assert_matches!(Record::decode(&message(None, value)), Err(DecodeError::MissingId));
    }

    #[test]
    fn rejects_missing_score() {
        let value = r#"{"id": "x", "articleSentiment": {"sentimentResponse": {"ratio": 0.1}}}"#;
        assert_matches!(Record::decode(&message(None, value)), Err(DecodeError::Malformed(_)));
    }

    #[test]
    fn rejects_garbage() {
        assert_matches!(
            Record::decode(&message(None, "not json")),
            Err(DecodeError::Malformed(_))
        );
    }

    #[test]
    fn encoded_value_decodes_back() {
        let record = Record::new(
            "r-1",
            42,
            ArticleSentiment {
                article: Article {
                    title: "t".into(),
                    ..Article::default()
                },
                sentiment_response: SentimentResponse::new(0.5, -2.0).with_kind("negative"),
            },
        );
        let bytes = encode_value(&record).unwrap();
        let decoded = Record::decode(&RawMessage::new(None, bytes, 42)).unwrap();
        assert_eq!(decoded, record);
    }
}
