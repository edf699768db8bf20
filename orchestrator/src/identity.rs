//! Canonical task naming and worker identity.
//!
//! A worker identity is `<CanonicalTaskName>@<tenant_id>`. Canonical names are
//! purely alphanumeric, so the first `@` always separates the two halves and
//! distinct `(canonical name, tenant)` pairs never produce the same string.

use once_cell::sync::Lazy;
use regex::Regex;

static WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Z]+[a-z0-9]*|[a-z0-9]+").expect("valid regex"));

const FILLER_WORDS: &[&str] = &["the", "a", "an", "and", "of", "for", "to", "step", "stage"];

/// Role suffix appended to a canonical task name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Api,
    Processor,
    Manager,
    Gateway,
    Service,
}

impl WorkerRole {
    pub fn suffix(self) -> &'static str {
        match self {
            WorkerRole::Api => "API",
            WorkerRole::Processor => "Processor",
            WorkerRole::Manager => "Manager",
            WorkerRole::Gateway => "Gateway",
            WorkerRole::Service => "Service",
        }
    }

    /// Words that name the role outright. These are stripped from the name.
    fn from_role_word(word: &str) -> Option<Self> {
        match word {
            "api" | "endpoint" => Some(WorkerRole::Api),
            "processor" | "process" | "processing" => Some(WorkerRole::Processor),
            "manager" | "manage" | "management" => Some(WorkerRole::Manager),
            "gateway" => Some(WorkerRole::Gateway),
            "service" | "svc" => Some(WorkerRole::Service),
            _ => None,
        }
    }

    /// Words that only suggest a role. These stay in the name.
    fn from_hint_word(word: &str) -> Option<Self> {
        match word {
            "search" | "lookup" | "query" | "catalog" | "catalogue" => Some(WorkerRole::Api),
            "payment" | "payments" | "transaction" | "billing" | "fulfillment" | "shipping" => {
                Some(WorkerRole::Processor)
            }
            "account" | "inventory" | "profile" | "session" | "subscription" => {
                Some(WorkerRole::Manager)
            }
            "auth" | "authentication" | "login" | "routing" | "proxy" => Some(WorkerRole::Gateway),
            _ => None,
        }
    }
}

/// Normalize a free-text step name into a canonical worker name.
///
/// `"process payment"` → `PaymentProcessor`, `"Checkout"` → `CheckoutService`,
/// `"checkout-api"` → `CheckoutAPI`.
pub fn canonical_task_name(raw: &str) -> String {
    let words: Vec<String> = WORD_RE
        .find_iter(raw)
        .map(|m| m.as_str().to_ascii_lowercase())
        .collect();

    let explicit = words.iter().rev().find_map(|w| WorkerRole::from_role_word(w));
    let hinted = words.iter().find_map(|w| WorkerRole::from_hint_word(w));
    let role = explicit.or(hinted).unwrap_or(WorkerRole::Service);

    let mut name: String = words
        .iter()
        .filter(|w| !FILLER_WORDS.contains(&w.as_str()))
        .filter(|w| WorkerRole::from_role_word(w).is_none())
        .map(|w| title_case(w))
        .collect();

    if name.is_empty() {
        name.push_str("Step");
    }
    name.push_str(role.suffix());
    name
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Stable identity of one logical worker: canonical task name + tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerIdentity(String);

impl WorkerIdentity {
    pub fn derive(task_name: &str, tenant_id: &str) -> Self {
        Self(format!("{}@{tenant_id}", canonical_task_name(task_name)))
    }

    /// Parse an identity string previously produced by [`WorkerIdentity::derive`].
    pub fn parse(raw: &str) -> Option<Self> {
        let (name, _tenant) = raw.split_once('@')?;
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn canonical_name(&self) -> &str {
        self.0.split_once('@').map(|(name, _)| name).unwrap_or(&self.0)
    }

    pub fn tenant_id(&self) -> &str {
        self.0.split_once('@').map(|(_, tenant)| tenant).unwrap_or("")
    }
}

impl std::fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
