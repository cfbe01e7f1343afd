//! Instruction templates for the agent-driven stages

use crate::provider::CapabilityDescriptor;
use chrono::NaiveDate;

fn capability_list(capabilities: &[CapabilityDescriptor]) -> String {
    if capabilities.is_empty() {
        return "        (no tools are available; answer from your own knowledge)\n".to_string();
    }

    capabilities
        .iter()
        .enumerate()
        .map(|(i, capability)| {
            format!(
                "        {}. tool name: {}; tool goal: {}\n",
                i + 1,
                capability.name,
                capability.description_text()
            )
        })
        .collect()
}

/// Instructions for one stage, rendered once the capability snapshot is known
#[derive(Debug, Clone, PartialEq)]
pub enum InstructionTemplate {
    Research { crop_disease: String, today: NaiveDate },
    PromptSynthesis { crop: String, max_images: usize },
    Notify { recipients: Vec<String>, subject: String, mail_capability: String },
    Text(String),
}

impl InstructionTemplate {
    pub fn render(&self, capabilities: &[CapabilityDescriptor]) -> String {
        match self {
            InstructionTemplate::Research { crop_disease, today } => research(crop_disease, capabilities, *today),
            InstructionTemplate::PromptSynthesis { crop, max_images } => prompt_synthesis(crop, *max_images),
            InstructionTemplate::Notify {
                recipients,
                subject,
                mail_capability,
            } => notify(recipients, subject, mail_capability),
            InstructionTemplate::Text(text) => text.clone(),
        }
    }
}

pub fn research(crop_disease: &str, capabilities: &[CapabilityDescriptor], today: NaiveDate) -> String {
    format!(
        r#"You are a crop disease diagnosis researcher. You are able to search the web for the latest
developments in {crop_disease} crop diseases. Based on the request, carry out the necessary research
and respond with your findings.

Your goal:
1. Explore current crop disease trends related to {crop_disease} using web search.
2. Review the geographic regions and climate conditions for {crop_disease} pathology and treatment.
3. Recommend one or more treatment methods that best match emerging trends.
4. Today's date is {today}.

You can call the following tools:
{tools}
Once your analysis is complete, summarize the pathogen, the treatment methods and the medicine.
Cite the agricultural websites and research institutions you relied on by URL.

Respond only with JSON in this format:
{{"pathogen": "...", "treatment": "...", "medicine": "..."}}
"#,
        crop_disease = crop_disease,
        today = today.format("%Y-%m-%d"),
        tools = capability_list(capabilities),
    )
}

pub fn prompt_synthesis(crop: &str, max_images: usize) -> String {
    format!(
        r#"You are a visual crop disease assistant. Based on the pathogen in the user message,
write vivid, descriptive prompts for an AI image generation model showing how the disease
progresses on {crop} plants over the coming months, one prompt per stage of progression,
at most {max_images} prompts. Write one short, punchy diagnosis caption for each prompt.

Respond only with JSON in this format:
{{"prompts": ["...", "..."], "captions": ["...", "..."]}}
"#,
        crop = crop,
        max_images = max_images.max(1),
    )
}

pub fn notify(recipients: &[String], subject: &str, mail_capability: &str) -> String {
    format!(
        r#"You are an email communication assistant sending a professional HTML report to farmers.
Convert the report in the user message into clean, well presented HTML and send exactly one
email to {recipients} with the subject "{subject}".

Use only the '{mail_capability}' tool to send the email.

After the tool answers, respond only with JSON in this format:
{{"status": "success" or "failure", "message": "..."}}
"#,
        recipients = recipients.join(", "),
        subject = subject,
        mail_capability = mail_capability,
    )
}
