//! Ticket model: one support email tracked end-to-end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline state of a ticket.
///
/// `Pending → Extracted → Drafted` on success; `Failed` is reachable from
/// `Pending` (extraction) and `Extracted` (drafting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Extracted,
    Drafted,
    Failed,
}

impl TicketStatus {
    pub const ALL: [TicketStatus; 4] = [
        TicketStatus::Pending,
        TicketStatus::Extracted,
        TicketStatus::Drafted,
        TicketStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Extracted => "extracted",
            Self::Drafted => "drafted",
            Self::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `next` respects forward-only ordering.
    pub fn can_transition_to(&self, next: TicketStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Extracted)
                | (Self::Pending, Self::Failed)
                | (Self::Extracted, Self::Drafted)
                | (Self::Extracted, Self::Failed)
        )
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TicketStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "extracted" => Ok(Self::Extracted),
            "drafted" => Ok(Self::Drafted),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown ticket status: {}", s)),
        }
    }
}

/// Which stage a failed ticket died in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Extraction,
    Drafting,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Drafting => "drafting",
        }
    }
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureStage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extraction" => Ok(Self::Extraction),
            "drafting" => Ok(Self::Drafting),
            _ => Err(format!("Unknown failure stage: {}", s)),
        }
    }
}

/// Customer sentiment as judged by extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
    UrgentNegative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
            Self::UrgentNegative => "urgent_negative",
        }
    }

    pub fn is_negative(&self) -> bool {
        matches!(self, Self::Negative | Self::UrgentNegative)
    }
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Sentiment {
    type Err = String;

    /// Lenient: models answer "Negative", "urgent-negative", "Urgent Negative"...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c })
            .collect();
        match normalized.as_str() {
            "positive" => Ok(Self::Positive),
            "neutral" => Ok(Self::Neutral),
            "negative" => Ok(Self::Negative),
            "urgent_negative" | "very_negative" => Ok(Self::UrgentNegative),
            _ => Err(format!("Unknown sentiment: {}", s)),
        }
    }
}

/// Urgency on a 1 (can wait) to 5 (drop everything) scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Urgency(u8);

impl Urgency {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn new(value: i64) -> Result<Self, String> {
        if (Self::MIN as i64..=Self::MAX as i64).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(format!(
                "urgency {value} outside {}..={}",
                Self::MIN,
                Self::MAX
            ))
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Urgency {
    type Error = String;
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Urgency> for i64 {
    fn from(u: Urgency) -> Self {
        u.0 as i64
    }
}

/// Structured output of the extraction step. All four fields travel together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub sentiment: Sentiment,
    pub urgency: Urgency,
    pub summary: String,
    /// JSON object of phone numbers, alternate addresses, etc. `{}` if none.
    pub contact_info: serde_json::Value,
}

/// A message as listed by the mailbox, before it becomes a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Stable source id (Message-ID header or generated surrogate).
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Insert payload for a new `pending` ticket.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl From<&RawMessage> for NewTicket {
    fn from(msg: &RawMessage) -> Self {
        Self {
            id: msg.id.clone(),
            sender: msg.sender.clone(),
            subject: msg.subject.clone(),
            body: msg.body.clone(),
            received_at: msg.received_at,
        }
    }
}

/// A persisted ticket row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub received_at: DateTime<Utc>,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub status: TicketStatus,
    pub failure_stage: Option<FailureStage>,
    pub failure_note: Option<String>,
    pub sentiment: Option<Sentiment>,
    pub urgency: Option<Urgency>,
    pub summary: Option<String>,
    pub contact_info: Option<serde_json::Value>,
    pub draft_response: Option<String>,
    pub extraction_attempts: u32,
    pub drafting_attempts: u32,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// All extraction fields, if the ticket has been extracted.
    pub fn extraction(&self) -> Option<Extraction> {
        Some(Extraction {
            sentiment: self.sentiment?,
            urgency: self.urgency?,
            summary: self.summary.clone()?,
            contact_info: self.contact_info.clone()?,
        })
    }

    /// True when either all extraction fields are set or none are.
    pub fn extraction_is_consistent(&self) -> bool {
        let set = [
            self.sentiment.is_some(),
            self.urgency.is_some(),
            self.summary.is_some(),
            self.contact_info.is_some(),
        ];
        set.iter().all(|s| *s) || set.iter().all(|s| !*s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ticket(id: &str, urgency: Option<i64>, received_at: DateTime<Utc>) -> Ticket {
        Ticket {
            id: id.into(),
            received_at,
            sender: "alice@example.com".into(),
            subject: "Help".into(),
            body: "body".into(),
            status: TicketStatus::Pending,
            failure_stage: None,
            failure_note: None,
            sentiment: urgency.map(|_| Sentiment::Neutral),
            urgency: urgency.map(|u| Urgency::new(u).unwrap()),
            summary: urgency.map(|_| "summary".to_string()),
            contact_info: urgency.map(|_| serde_json::json!({})),
            draft_response: None,
            extraction_attempts: 0,
            drafting_attempts: 0,
            resolved_at: None,
            created_at: received_at,
            updated_at: received_at,
        }
    }

    #[test]
    fn status_roundtrip_through_str() {
        for status in TicketStatus::ALL {
            assert_eq!(status.as_str().parse::<TicketStatus>().unwrap(), status);
        }
        assert!("resolved".parse::<TicketStatus>().is_err());
    }

    #[test]
    fn status_transitions_are_forward_only() {
        assert!(TicketStatus::Pending.can_transition_to(TicketStatus::Extracted));
        assert!(TicketStatus::Extracted.can_transition_to(TicketStatus::Drafted));
        assert!(TicketStatus::Extracted.can_transition_to(TicketStatus::Failed));
        assert!(!TicketStatus::Drafted.can_transition_to(TicketStatus::Pending));
        assert!(!TicketStatus::Failed.can_transition_to(TicketStatus::Extracted));
        assert!(!TicketStatus::Pending.can_transition_to(TicketStatus::Drafted));
    }

    #[test]
    fn sentiment_parse_is_lenient() {
        assert_eq!("Negative".parse::<Sentiment>().unwrap(), Sentiment::Negative);
        assert_eq!(
            "urgent-negative".parse::<Sentiment>().unwrap(),
            Sentiment::UrgentNegative
        );
        assert_eq!(
            " Urgent Negative ".parse::<Sentiment>().unwrap(),
            Sentiment::UrgentNegative
        );
        assert!("furious".parse::<Sentiment>().is_err());
    }

    #[test]
    fn urgency_bounds() {
        assert!(Urgency::new(0).is_err());
        assert!(Urgency::new(6).is_err());
        assert_eq!(Urgency::new(5).unwrap().value(), 5);
        let parsed: Urgency = serde_json::from_str("3").unwrap();
        assert_eq!(parsed.value(), 3);
        assert!(serde_json::from_str::<Urgency>("9").is_err());
    }

    #[test]
    fn extraction_consistency() {
        let t0 = Utc::now();
        let extracted = make_ticket("a", Some(3), t0);
        assert!(extracted.extraction_is_consistent());
        assert!(extracted.extraction().is_some());

        let pending = make_ticket("b", None, t0);
        assert!(pending.extraction_is_consistent());
        assert!(pending.extraction().is_none());

        let mut partial = make_ticket("c", Some(3), t0);
        partial.summary = None;
        assert!(!partial.extraction_is_consistent());
    }
}
