use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use ht_core::Record;

pub const ARTICLE_TITLE: &str = "article_title";
pub const ARTICLE_DESCRIPTION: &str = "article_description";
pub const ARTICLE_CONTENT: &str = "article_content";
pub const ARTICLE_PUB_DATE: &str = "article_pub_date";
pub const ARTICLE_URL: &str = "article_url";
pub const ARTICLE_IMAGE_URL: &str = "article_image_url";
pub const ARTICLE_SOURCE: &str = "article_source";
pub const ARTICLE_COUNTRY: &str = "article_country";
pub const ARTICLE_LANGUAGE: &str = "article_language";
pub const ARTICLE_AUTHORS: &str = "article_authors";
pub const SENTIMENT_RATIO: &str = "sentiment_ratio";
pub const SENTIMENT_SCORE: &str = "sentiment_score";
pub const SENTIMENT_TYPE: &str = "sentiment_type";
pub const SENTIMENT_KEYWORDS: &str = "sentiment_keywords";

/// A row for the column-family store: the record id as key, one column per field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Row {
    pub key: String,
    pub columns: BTreeMap<String, String>,
}

impl Row {
    pub fn from_record(record: &Record) -> Self {
        let article = record.article();
        let sentiment = record.sentiment();
        let columns = [
            (ARTICLE_TITLE, article.title.clone()),
            (ARTICLE_DESCRIPTION, article.description.clone()),
            (ARTICLE_CONTENT, article.content.clone()),
            (ARTICLE_PUB_DATE, article.pub_date.clone()),
            (ARTICLE_URL, article.url.clone()),
            (ARTICLE_IMAGE_URL, article.image_url.clone()),
            (ARTICLE_SOURCE, article.source.clone()),
            (ARTICLE_COUNTRY, article.country.clone()),
            (ARTICLE_LANGUAGE, article.language.clone()),
            (ARTICLE_AUTHORS, join_list(&article.authors)),
            (SENTIMENT_RATIO, sentiment.ratio.to_string()),
            (SENTIMENT_SCORE, sentiment.score.to_string()),
            (SENTIMENT_TYPE, sentiment.kind.clone()),
            (SENTIMENT_KEYWORDS, join_list(&sentiment.keywords)),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();

        Self {
            key: record.id.clone(),
            columns,
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns.get(column).map(String::as_str)
    }
}

/// `[a, b, c]`, the way list columns are stored.
pub fn join_list<I>(items: I) -> String
where
    I: IntoIterator,
    I::Item: Display,
{
    let joined = items
        .into_iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{joined}]")
}
