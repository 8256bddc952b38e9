//! Prompt construction for extraction and drafting.

use crate::tickets::Sentiment;

/// Facts the drafter may rely on when answering customers.
pub const KNOWLEDGE_BASE: &str = "\
- Standard support hours are 9 AM to 6 PM, Monday to Friday.\n\
- Passwords can be reset from the login page via the 'Forgot Password' link.\n\
- The premium plan costs $99/month and includes advanced analytics and priority support.\n\
- Billing issues are handled by the billing department; tell the customer to reply to this email and it will be forwarded.";

/// Longest body excerpt sent to the model.
const MAX_BODY_CHARS: usize = 4000;

pub fn build_extraction_system_prompt() -> String {
    "You analyze customer support emails and extract structured facts.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"sentiment\": \"...\", \"urgency\": 1, \"summary\": \"...\", \"contact_info\": {}}\n\n\
     Fields:\n\
     - \"sentiment\": one of \"positive\", \"neutral\", \"negative\", \"urgent_negative\"\n\
     - \"urgency\": integer 1 (can wait) to 5 (drop everything)\n\
     - \"summary\": one sentence stating what the customer wants\n\
     - \"contact_info\": object of phone numbers or alternate emails found in the message, {} if none"
        .to_string()
}

pub fn build_extraction_user_prompt(subject: &str, body: &str) -> String {
    let body_preview: String = body.chars().take(MAX_BODY_CHARS).collect();
    format!("Subject: {subject}\n\nEmail:\n---\n{body_preview}\n---")
}

pub fn build_drafting_system_prompt() -> String {
    format!(
        "You are a professional, empathetic customer support assistant drafting a reply.\n\n\
         Instructions:\n\
         1. If the customer is unhappy, open by acknowledging their frustration.\n\
         2. Be friendly, helpful and concise.\n\
         3. Answer from the knowledge base only; do not invent policies.\n\
         4. End with a clear next step.\n\
         5. Do not add a sign-off; one is appended later.\n\n\
         Knowledge base:\n---\n{KNOWLEDGE_BASE}\n---\n\n\
         Reply with the draft text only."
    )
}

pub fn build_drafting_user_prompt(sentiment: Sentiment, summary: &str, subject: &str) -> String {
    let tone_hint = if sentiment.is_negative() {
        "The customer is frustrated."
    } else {
        "The customer is calm."
    };
    format!(
        "Subject: {subject}\n\
         Customer sentiment: {sentiment}\n\
         {tone_hint}\n\
         Customer request: {summary}\n\n\
         Draft the reply:"
    )
}
