use chrono::{DateTime, NaiveDateTime, Utc};

use crate::dashboard::Lead;

/// Search and page selection over the cached lead list.
#[derive(Debug, Clone)]
pub struct LeadQuery {
    /// Case-insensitive substring of the company name; empty matches all.
    pub search: String,
    /// 1-based.
    pub page: usize,
    pub page_size: usize,
}

impl Default for LeadQuery {
    fn default() -> Self {
        Self {
            search: String::new(),
            page: 1,
            page_size: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeadPage {
    pub items: Vec<Lead>,
    /// Leads matching the search, over all pages.
    pub total: usize,
    pub page: usize,
    pub total_pages: usize,
}

/// Capture time of a lead. The backend sends ISO-8601, with or without an
/// offset; offset-less values are taken as UTC.
pub fn captured_at(lead: &Lead) -> Option<DateTime<Utc>> {
    let raw = lead.captured_at.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Filter by company name, sort newest first and cut out one page.
///
/// The page is clamped into range, so a search that shrinks the result set
/// never lands on an empty page while results exist.
pub fn page_leads(leads: &[Lead], query: &LeadQuery) -> LeadPage {
    let needle = query.search.to_lowercase();
    let mut matching: Vec<&Lead> = leads
        .iter()
        .filter(|l| needle.is_empty() || l.company_name.to_lowercase().contains(&needle))
        .collect();
    // undated leads go last
    matching.sort_by(|a, b| captured_at(b).cmp(&captured_at(a)));

    let page_size = query.page_size.max(1);
    let total = matching.len();
    let total_pages = total.div_ceil(page_size);
    let page = query.page.clamp(1, total_pages.max(1));
    let items = matching
        .into_iter()
        .skip((page - 1) * page_size)
        .take(page_size)
        .cloned()
        .collect();

    LeadPage {
        items,
        total,
        page,
        total_pages,
    }
}
