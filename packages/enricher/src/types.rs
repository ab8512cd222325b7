use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// A backlog row parsed into a scrapeable unit of work.
///
/// Rows are owned by the upstream lead importer; this subsystem only reads
/// them. `id` doubles as the advisory-lock key, `place_id` is the sink key.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: i32,
    pub place_id: String,
    pub website: Url,
    pub name: Option<String>,
    pub category: Option<String>,
    pub country: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub review_count: Option<i64>,
    pub review_rating: Option<f64>,
    /// The full upstream payload, preserved untouched for downstream use.
    pub raw_payload: Value,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("payload has an unfetchable website url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl WorkItem {
    /// Parse a backlog row's JSONB payload.
    ///
    /// Rows without a `place_id` or a parseable `website` are not claimable.
    pub fn from_row(id: i32, payload: Value) -> Result<Self, PayloadError> {
        let place_id = payload
            .get("place_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or(PayloadError::MissingField("place_id"))?
            .to_string();
        let website = payload
            .get("website")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or(PayloadError::MissingField("website"))?;
        let website = Url::parse(website)?;

        let get_str = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        Ok(Self {
            id,
            place_id,
            website,
            name: get_str("name"),
            category: get_str("category"),
            country: get_str("country"),
            address: get_str("address"),
            latitude: payload.get("lat").and_then(Value::as_f64),
            longitude: payload.get("lng").and_then(Value::as_f64),
            review_count: payload.get("review_count").and_then(Value::as_i64),
            review_rating: payload.get("review_rating").and_then(Value::as_f64),
            raw_payload: payload,
        })
    }
}

/// Outcome of one scrape attempt, as stored in the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStatus {
    Success,
    Failed,
}

impl ScrapeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeStatus::Success => "success",
            ScrapeStatus::Failed => "failed",
        }
    }
}

/// One lead's enrichment result, ready for upsert.
///
/// Merge policy on conflict is intentionally asymmetric (see `sink`):
/// `emails` and `whatsapp` concatenate across scrapes, most social handles
/// fill in only when previously null, everything else is overwritten.
#[derive(Debug, Clone)]
pub struct ContactRecord {
    pub place_id: String,
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub whatsapp: Vec<String>,
    pub facebook: Option<String>,
    pub instagram: Option<String>,
    pub linkedin: Option<String>,
    pub twitter: Option<String>,
    pub tiktok: Option<String>,
    pub youtube: Option<String>,
    pub validated_emails: Option<Value>,
    pub validated_whatsapp: Option<Value>,
    pub final_url: Option<String>,
    pub was_redirected: bool,
    pub status: ScrapeStatus,
    pub error: Option<String>,
    pub processing_time_seconds: f64,
    pub pages_scraped: i32,
}

impl ContactRecord {
    /// An empty successful record for `place_id`.
    pub fn new(place_id: impl Into<String>) -> Self {
        Self {
            place_id: place_id.into(),
            emails: Vec::new(),
            phones: Vec::new(),
            whatsapp: Vec::new(),
            facebook: None,
            instagram: None,
            linkedin: None,
            twitter: None,
            tiktok: None,
            youtube: None,
            validated_emails: None,
            validated_whatsapp: None,
            final_url: None,
            was_redirected: false,
            status: ScrapeStatus::Success,
            error: None,
            processing_time_seconds: 0.0,
            pages_scraped: 0,
        }
    }

    /// A failed-status record carrying only the error.
    ///
    /// Per-item fetch failures become rows like this instead of aborting the
    /// batch loop.
    pub fn failed(
        place_id: impl Into<String>,
        error: impl Into<String>,
        processing_time_seconds: f64,
    ) -> Self {
        let mut record = Self::new(place_id);
        record.status = ScrapeStatus::Failed;
        record.error = Some(error.into());
        record.processing_time_seconds = processing_time_seconds;
        record
    }

    pub fn email_count(&self) -> i32 {
        self.emails.len() as i32
    }

    pub fn phone_count(&self) -> i32 {
        self.phones.len() as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_payload() {
        let payload = json!({
            "place_id": "ChIJabc123",
            "website": "https://example.com",
            "name": "Example Cafe",
            "category": "cafe",
            "country": "DE",
            "address": "Hauptstr. 1",
            "lat": 52.5,
            "lng": 13.4,
            "review_count": 42,
            "review_rating": 4.5,
            "upstream_extra": {"keep": "me"}
        });

        let item = WorkItem::from_row(7, payload.clone()).unwrap();
        assert_eq!(item.id, 7);
        assert_eq!(item.place_id, "ChIJabc123");
        assert_eq!(item.website.as_str(), "https://example.com/");
        assert_eq!(item.review_count, Some(42));
        assert_eq!(item.raw_payload, payload);
    }

    #[test]
    fn rejects_missing_key_or_url() {
        let no_key = serde_json::json!({"website": "https://example.com"});
        assert!(matches!(
            WorkItem::from_row(1, no_key),
            Err(PayloadError::MissingField("place_id"))
        ));

        let empty_url = serde_json::json!({"place_id": "x", "website": ""});
        assert!(matches!(
            WorkItem::from_row(1, empty_url),
            Err(PayloadError::MissingField("website"))
        ));

        let bad_url = serde_json::json!({"place_id": "x", "website": "not a url"});
        assert!(matches!(
            WorkItem::from_row(1, bad_url),
            Err(PayloadError::InvalidUrl(_))
        ));
    }

    #[test]
    fn failed_record_carries_error() {
        let record = ContactRecord::failed("p1", "timed out", 12.5);
        assert_eq!(record.status, ScrapeStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("timed out"));
        assert_eq!(record.pages_scraped, 0);
        assert_eq!(record.email_count(), 0);
    }
}
