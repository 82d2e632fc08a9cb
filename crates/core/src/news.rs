use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A news article as published by the upstream scraper.
///
/// Every text field is optional on the wire and decodes to an empty string.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Article {
    pub title: String,
    pub description: String,
    pub content: String,
    #[serde(alias = "pub_date")]
    pub pub_date: String,
    pub url: String,
    #[serde(alias = "image_url")]
    pub image_url: String,
    pub source: String,
    pub country: String,
    pub language: String,
    pub authors: Vec<String>,
}

/// Output of the sentiment scorer for one article.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentimentResponse {
    pub ratio: f64,
    pub score: f64,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub keywords: BTreeSet<String>,
}

impl SentimentResponse {
    pub fn new(ratio: f64, score: f64) -> Self {
        Self {
            ratio,
            score,
            kind: String::new(),
            keywords: BTreeSet::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArticleSentiment {
    #[serde(default)]
    pub article: Article,
    #[serde(alias = "sentiment_response")]
    pub sentiment_response: SentimentResponse,
}
