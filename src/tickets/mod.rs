//! Ticket domain types shared by every component.

pub mod model;

pub use model::{
    Extraction, FailureStage, NewTicket, RawMessage, Sentiment, Ticket, TicketStatus, Urgency,
};
