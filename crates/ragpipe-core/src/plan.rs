use serde::{Deserialize, Serialize};

/// One site-restricted query, bound to the domain that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedQuery {
    pub domain: String,
    pub question: String,
}

impl PlannedQuery {
    /// Render the provider query string, e.g. `site:cdc.gov How to prevent Rabies?`.
    pub fn rendered(&self) -> String {
        format!("site:{} {}", self.domain, self.question)
    }
}

/// Expand a question into one planned query per trusted domain.
///
/// Pure: output order follows `domains` exactly, one entry per element.
pub fn plan_queries(question: &str, domains: &[String]) -> Vec<PlannedQuery> {
    domains
        .iter()
        .map(|d| PlannedQuery {
            domain: d.trim().to_string(),
            question: question.trim().to_string(),
        })
        .collect()
}
