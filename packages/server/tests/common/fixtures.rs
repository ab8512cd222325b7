//! Fixture helpers for seeding the backlog and reading back sink rows.

use serde_json::json;
use sqlx::{PgPool, Row};

use enricher::types::ContactRecord;

/// Insert a minimal scrapeable lead, returning its backlog id.
pub async fn insert_lead(pool: &PgPool, place_id: &str, website: &str) -> i32 {
    insert_lead_payload(
        pool,
        json!({
            "place_id": place_id,
            "website": website,
            "name": format!("Test business {}", place_id),
        }),
    )
    .await
}

/// Insert a lead with an arbitrary payload, returning its backlog id.
pub async fn insert_lead_payload(pool: &PgPool, payload: serde_json::Value) -> i32 {
    sqlx::query("INSERT INTO leads (payload) VALUES ($1) RETURNING id")
        .bind(payload)
        .fetch_one(pool)
        .await
        .expect("failed to insert lead")
        .get("id")
}

/// A `lead_contacts` row read back for assertions.
#[derive(Debug)]
pub struct ContactRow {
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub whatsapp: Vec<String>,
    pub facebook: Option<String>,
    pub instagram: Option<String>,
    pub tiktok: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub final_url: Option<String>,
    pub was_redirected: bool,
    pub email_count: i32,
    pub phone_count: i32,
    pub scrape_count: i32,
}

pub async fn fetch_contact(pool: &PgPool, place_id: &str) -> Option<ContactRow> {
    let row = sqlx::query(
        r#"
        SELECT emails, phones, whatsapp, facebook, instagram, tiktok,
               status, error, final_url, was_redirected,
               email_count, phone_count, scrape_count
        FROM lead_contacts WHERE place_id = $1
        "#,
    )
    .bind(place_id)
    .fetch_optional(pool)
    .await
    .expect("failed to fetch contact row")?;

    Some(ContactRow {
        emails: row.get("emails"),
        phones: row.get("phones"),
        whatsapp: row.get("whatsapp"),
        facebook: row.get("facebook"),
        instagram: row.get("instagram"),
        tiktok: row.get("tiktok"),
        status: row.get("status"),
        error: row.get("error"),
        final_url: row.get("final_url"),
        was_redirected: row.get("was_redirected"),
        email_count: row.get("email_count"),
        phone_count: row.get("phone_count"),
        scrape_count: row.get("scrape_count"),
    })
}

/// A successful record with the given emails, everything else empty.
pub fn record_with_emails(place_id: &str, emails: &[&str]) -> ContactRecord {
    let mut record = ContactRecord::new(place_id);
    record.emails = emails.iter().map(|s| s.to_string()).collect();
    record
}
