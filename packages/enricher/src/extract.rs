use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

/// Contact details pulled out of one fetched page.
#[derive(Debug, Default, Clone)]
pub struct ExtractedContacts {
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub whatsapp: Vec<String>,
    pub facebook: Option<String>,
    pub instagram: Option<String>,
    pub linkedin: Option<String>,
    pub twitter: Option<String>,
    pub tiktok: Option<String>,
    pub youtube: Option<String>,
}

impl ExtractedContacts {
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty()
            && self.phones.is_empty()
            && self.whatsapp.is_empty()
            && self.facebook.is_none()
            && self.instagram.is_none()
            && self.linkedin.is_none()
            && self.twitter.is_none()
            && self.tiktok.is_none()
            && self.youtube.is_none()
    }
}

/// Turns a page's HTML into contact details. The heuristics behind this are
/// pluggable; the orchestrator only depends on this seam.
pub trait ContactExtractor: Send + Sync {
    fn extract(&self, html: &str, page_url: &Url) -> ExtractedContacts;
}

lazy_static! {
    static ref HREF_REGEX: Regex = Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#).unwrap();

    // Simplified RFC 5322 shape, enough to reject mailto junk
    static ref EMAIL_REGEX: Regex =
        Regex::new(r"(?i)^[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}$").unwrap();
}

/// Default extractor: reads explicit contact hrefs (`mailto:`, `tel:`,
/// WhatsApp links, social profile links). It deliberately does not mine
/// free text, so it produces few false positives.
#[derive(Debug, Default)]
pub struct HrefContactExtractor;

impl ContactExtractor for HrefContactExtractor {
    fn extract(&self, html: &str, _page_url: &Url) -> ExtractedContacts {
        let mut contacts = ExtractedContacts::default();
        let mut seen = HashSet::new();

        for cap in HREF_REGEX.captures_iter(html) {
            let href = cap[1].trim();
            let lower = href.to_ascii_lowercase();

            if let Some(rest) = lower.strip_prefix("mailto:") {
                let email = rest.split(&['?', '&'][..]).next().unwrap_or("").to_string();
                if EMAIL_REGEX.is_match(&email) && seen.insert(email.clone()) {
                    contacts.emails.push(email);
                }
            } else if let Some(rest) = lower.strip_prefix("tel:") {
                let phone: String = rest
                    .chars()
                    .filter(|c| c.is_ascii_digit() || *c == '+')
                    .collect();
                if phone.len() >= 7 && seen.insert(phone.clone()) {
                    contacts.phones.push(phone);
                }
            } else if let Some(number) = whatsapp_number(&lower) {
                if seen.insert(format!("wa:{}", number)) {
                    contacts.whatsapp.push(number);
                }
            } else {
                assign_social(&mut contacts, href, &lower);
            }
        }

        contacts
    }
}

fn whatsapp_number(lower: &str) -> Option<String> {
    let rest = if let Some(rest) = lower.split("wa.me/").nth(1) {
        rest
    } else if let Some(rest) = lower.split("api.whatsapp.com/send?phone=").nth(1) {
        rest
    } else {
        return None;
    };
    let number: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    if number.chars().filter(|c| c.is_ascii_digit()).count() >= 7 {
        Some(number)
    } else {
        None
    }
}

/// First profile link per network wins; share/intent widget links are noise.
fn assign_social(contacts: &mut ExtractedContacts, href: &str, lower: &str) {
    if lower.contains("sharer") || lower.contains("/share") || lower.contains("/intent/") {
        return;
    }

    let slot = if lower.contains("facebook.com/") {
        &mut contacts.facebook
    } else if lower.contains("instagram.com/") {
        &mut contacts.instagram
    } else if lower.contains("linkedin.com/") {
        &mut contacts.linkedin
    } else if lower.contains("twitter.com/") || lower.contains("//x.com/") {
        &mut contacts.twitter
    } else if lower.contains("tiktok.com/") {
        &mut contacts.tiktok
    } else if lower.contains("youtube.com/") || lower.contains("youtu.be/") {
        &mut contacts.youtube
    } else {
        return;
    };

    if slot.is_none() {
        *slot = Some(href.trim_end_matches('/').to_string());
    }
}
