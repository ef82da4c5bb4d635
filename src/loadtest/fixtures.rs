//! Synthetic `app.active` events.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const EVENT_NAME: &str = "app.active";

pub const APPS: [&str; 13] = [
    "frappe",
    "erpnext",
    "hrms",
    "crm",
    "helpdesk",
    "lms",
    "wiki",
    "insights",
    "builder",
    "payments",
    "gameplan",
    "drive",
    "print_designer",
];

pub const SITE_PLANS: [&str; 4] = ["free", "starter", "business", "enterprise"];

pub const DOMAINS: [&str; 4] = ["frappe.cloud", "frappecloud.com", "erpnext.com", "frappe.io"];

const COMPANIES: [&str; 20] = [
    "acme", "globex", "initech", "umbrella", "stark", "wayne", "hooli", "vandelay", "wonka", "cyberdyne",
    "soylent", "tyrell", "aperture", "gringotts", "oscorp", "nakatomi", "dunder", "pied", "massive", "octan",
];

const SUFFIXES: [&str; 10] = [
    "corp", "labs", "tech", "systems", "group", "solutions", "works", "retail", "foods", "logistics",
];

pub const MAX_ACTIVE_USERS: u32 = 50;
pub const MIN_REQUESTS: u32 = 10;
pub const MAX_REQUESTS: u32 = 1009;
pub const MAX_BACKDATE_SECS: i64 = 6 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventProperties {
    pub last_active_at: String,
    pub app_version: String,
    pub site_plan: String,
    pub active_users_6h: u32,
    pub requests_6h: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_name: String,
    pub site: String,
    pub app: String,
    pub captured_at: String,
    pub properties: EventProperties,
}

fn iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A pseudo-domain like `acme-labs.frappe.cloud`.
pub fn site_name<R: Rng>(rng: &mut R) -> String {
    let company = COMPANIES.choose(rng).copied().unwrap_or("acme");
    let suffix = SUFFIXES.choose(rng).copied().unwrap_or("corp");
    let domain = DOMAINS.choose(rng).copied().unwrap_or(DOMAINS[0]);

    match rng.gen_range(0..4) {
        0 => format!("{}-{}.{}", company, suffix, domain),
        1 => format!("{}{}.{}", company, suffix, domain),
        2 => format!("{}.{}", company, domain),
        _ => format!("{}-{}.{}", suffix, company, domain),
    }
}

pub fn app_version<R: Rng>(rng: &mut R) -> String {
    format!("{}.{}.{}", rng.gen_range(1..=15), rng.gen_range(0..=30), rng.gen_range(0..=99))
}

/// One event captured at `now`.
pub fn generate_event_at<R: Rng>(rng: &mut R, now: DateTime<Utc>) -> TelemetryEvent {
    let backdate = Duration::seconds(rng.gen_range(0..=MAX_BACKDATE_SECS));
    TelemetryEvent {
        event_name: EVENT_NAME.to_string(),
        site: site_name(rng),
        app: APPS.choose(rng).copied().unwrap_or(APPS[0]).to_string(),
        captured_at: iso(now),
        properties: EventProperties {
            last_active_at: iso(now - backdate),
            app_version: app_version(rng),
            site_plan: SITE_PLANS.choose(rng).copied().unwrap_or(SITE_PLANS[0]).to_string(),
            active_users_6h: rng.gen_range(1..=MAX_ACTIVE_USERS),
            requests_6h: rng.gen_range(MIN_REQUESTS..=MAX_REQUESTS),
        },
    }
}

/// An event from a known site, using the given app and plan.
pub fn generate_site_event_at<R: Rng>(
    rng: &mut R,
    now: DateTime<Utc>,
    site: &str,
    app: &str,
    plan: &str,
) -> TelemetryEvent {
    let mut event = generate_event_at(rng, now);
    event.site = site.to_string();
    event.app = app.to_string();
    event.properties.site_plan = plan.to_string();
    event
}

pub fn generate_event() -> TelemetryEvent {
    generate_event_at(&mut rand::thread_rng(), Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::parse_timestamp;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_generated_events_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let now = Utc::now();

        for _ in 0..2_000 {
            let event = generate_event_at(&mut rng, now);
            let props = &event.properties;

            assert_eq!(event.event_name, "app.active");
            assert!((1..=50).contains(&props.active_users_6h));
            assert!((10..=1009).contains(&props.requests_6h));
            assert!(SITE_PLANS.contains(&props.site_plan.as_str()));
            assert!(APPS.contains(&event.app.as_str()));

            let captured = parse_timestamp(&event.captured_at).unwrap();
            let last_active = parse_timestamp(&props.last_active_at).unwrap();
            assert!(last_active <= captured);
            assert!(captured - last_active <= Duration::hours(6));
        }
    }

    #[test]
    fn test_site_names_use_known_domains() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..500 {
            let site = site_name(&mut rng);
            assert!(DOMAINS.iter().any(|d| site.ends_with(&format!(".{}", d))), "{}", site);
            assert!(!site.starts_with('.') && !site.contains(".."));
        }
    }

    #[test]
    fn test_app_version_is_a_triple() {
        let mut rng = StdRng::seed_from_u64(3);
        let version = app_version(&mut rng);
        let parts: Vec<u32> = version.split('.').map(|p| p.parse().unwrap()).collect();
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn test_site_event_keeps_site_identity() {
        let mut rng = StdRng::seed_from_u64(5);
        let event = generate_site_event_at(&mut rng, Utc::now(), "acme.frappe.io", "wiki", "business");
        assert_eq!(event.site, "acme.frappe.io");
        assert_eq!(event.app, "wiki");
        assert_eq!(event.properties.site_plan, "business");
        assert!((1..=50).contains(&event.properties.active_users_6h));
    }

    #[test]
    fn test_serializes_to_ingest_shape() {
        let value = serde_json::to_value(generate_event()).unwrap();
        assert_eq!(value["event_name"], "app.active");
        assert!(value["properties"]["active_users_6h"].is_u64());
        assert!(crate::models::IngestEvent::from_value(value).is_ok());
    }
}
