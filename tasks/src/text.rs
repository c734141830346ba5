//! Building embedding input text from document fields.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;

/// Renders the text a document is embedded from.
pub trait TextTemplate: Send + Sync {
    /// Text to embed. May be empty when the document has nothing to say.
    fn render(&self, doc: &Document) -> String;

    /// Fields whose change invalidates an existing embedding.
    fn sensitive_fields(&self) -> Vec<String>;
}

/// Whether an update touching `changed` fields requires re-embedding.
pub fn touches_embedding_fields<S: AsRef<str>>(
    template: &dyn TextTemplate,
    changed: &[S],
) -> bool {
    let sensitive = template.sensitive_fields();
    changed
        .iter()
        .any(|field| sensitive.iter().any(|s| s == field.as_ref()))
}

/// First non-empty string among `keys`.
fn first_text<'a>(doc: &'a Document, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| doc.text_field(key))
}

fn first_text_in<'a>(object: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| {
        object
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    })
}

/// Render a scalar as text. Arrays are joined with `", "`.
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(value_text).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    }
}

/// First non-empty array of strings among `keys`.
fn string_list(doc: &Document, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .filter_map(|key| doc.field(key))
        .map(|value| match value {
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => value_text(value).into_iter().collect(),
        })
        .find(|list: &Vec<String>| !list.is_empty())
        .unwrap_or_default()
}

/// `label: value` for each listed field that has a value, joined with `" | "`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTemplate {
    pub fields: Vec<String>,
}

impl FieldTemplate {
    pub fn new<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl TextTemplate for FieldTemplate {
    fn render(&self, doc: &Document) -> String {
        self.fields
            .iter()
            .filter_map(|name| {
                doc.field(name)
                    .and_then(value_text)
                    .map(|text| format!("{name}: {text}"))
            })
            .collect::<Vec<_>>()
            .join(" | ")
    }

    fn sensitive_fields(&self) -> Vec<String> {
        self.fields.clone()
    }
}

/// Candidate profile: name, skills, experience and summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandidateProfileTemplate;

impl CandidateProfileTemplate {
    const SENSITIVE: [&str; 15] = [
        "skills",
        "experience",
        "education",
        "courses",
        "personal_projects",
        "awards_and_achievements",
        "position_of_responsibility",
        "competitions",
        "extra_curricular_activities",
        "publications",
        "personal_information",
        "summary",
        "about",
        "industry",
        "socials",
    ];

    fn full_name(doc: &Document) -> String {
        let personal = doc.field("personal_information");
        let name: Vec<&str> = ["first_name", "last_name"]
            .iter()
            .filter_map(|key| personal.and_then(|p| first_text_in(p, &[*key])))
            .collect();
        if name.is_empty() {
            "Unnamed candidate".to_string()
        } else {
            name.join(" ")
        }
    }

    fn experience(doc: &Document) -> Option<String> {
        let entries = doc.field("experience").and_then(Value::as_array)?;
        let segments: Vec<String> = entries
            .iter()
            .filter(|entry| entry.is_object())
            .map(|entry| {
                let role = first_text_in(entry, &["role", "title"]).unwrap_or("Role n/a");
                let company =
                    first_text_in(entry, &["company", "organization"]).unwrap_or("Org n/a");
                let years = ["duration", "years"]
                    .iter()
                    .find_map(|key| entry.get(key).and_then(value_text))
                    .unwrap_or_default();
                format!("{role} at {company} ({years})")
            })
            .collect();
        (!segments.is_empty()).then(|| segments.join("; "))
    }
}

impl TextTemplate for CandidateProfileTemplate {
    fn render(&self, doc: &Document) -> String {
        let skills = string_list(doc, &["skills"]);
        let skills = if skills.is_empty() {
            "Skills not provided".to_string()
        } else {
            skills.join(", ")
        };
        let experience =
            Self::experience(doc).unwrap_or_else(|| "Experience not provided".to_string());
        let summary = first_text(doc, &["summary", "about"]).unwrap_or("No summary provided");

        format!(
            "{} | Skills: {skills} | Experience: {experience} | Summary: {summary}",
            Self::full_name(doc)
        )
    }

    fn sensitive_fields(&self) -> Vec<String> {
        Self::SENSITIVE.iter().map(ToString::to_string).collect()
    }
}

/// Job listing: title, terms, skills, industry, locations and description.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobListingTemplate;

impl JobListingTemplate {
    const SENSITIVE: [&str; 14] = [
        "title",
        "employmentType",
        "employment_type",
        "workModel",
        "work_model",
        "experienceRange",
        "skillsRequired",
        "skills",
        "industry",
        "industries",
        "locations",
        "location",
        "description",
        "company",
    ];

    fn locations(doc: &Document) -> Option<String> {
        let value = ["locations", "location"]
            .iter()
            .find_map(|key| doc.field(key))?;

        match value {
            Value::Array(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .filter_map(|item| match item {
                        Value::Object(_) => {
                            let place: Vec<&str> = ["city", "state", "country"]
                                .iter()
                                .filter_map(|key| first_text_in(item, &[*key]))
                                .collect();
                            (!place.is_empty()).then(|| place.join(", "))
                        }
                        other => value_text(other),
                    })
                    .collect();
                (!parts.is_empty()).then(|| parts.join(", "))
            }
            other => value_text(other),
        }
    }
}

impl TextTemplate for JobListingTemplate {
    fn render(&self, doc: &Document) -> String {
        let title = first_text(doc, &["title"]).unwrap_or("Untitled role");
        let employment_type =
            first_text(doc, &["employmentType", "employment_type"]).unwrap_or("Type n/a");
        let work_model = first_text(doc, &["workModel", "work_model"]).unwrap_or("Work model n/a");
        let experience_range = doc
            .field("experienceRange")
            .and_then(|range| first_text_in(range, &["summary"]))
            .unwrap_or("Experience range n/a");

        let skills = string_list(doc, &["skillsRequired", "skills"]);
        let skills = if skills.is_empty() {
            "Skills not provided".to_string()
        } else {
            skills.join(", ")
        };
        let industry = ["industry", "industries"]
            .iter()
            .find_map(|key| doc.field(key).and_then(value_text))
            .unwrap_or_else(|| "Industry n/a".to_string());
        let locations =
            Self::locations(doc).unwrap_or_else(|| "Locations not provided".to_string());
        let description = first_text(doc, &["description"]).unwrap_or("Description not provided");

        [
            title.to_string(),
            employment_type.to_string(),
            work_model.to_string(),
            experience_range.to_string(),
            format!("Skills: {skills}"),
            format!("Industry: {industry}"),
            format!("Locations: {locations}"),
            format!("Description: {description}"),
        ]
        .join(" | ")
    }

    fn sensitive_fields(&self) -> Vec<String> {
        Self::SENSITIVE.iter().map(ToString::to_string).collect()
    }
}

/// Template selection, as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemplateConfig {
    Fields { fields: Vec<String> },
    CandidateProfile,
    JobListing,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self::Fields {
            fields: vec!["title".to_string(), "body".to_string()],
        }
    }
}

impl TemplateConfig {
    pub fn build(&self) -> Arc<dyn TextTemplate> {
        match self {
            Self::Fields { fields } => Arc::new(FieldTemplate::new(fields.iter().cloned())),
            Self::CandidateProfile => Arc::new(CandidateProfileTemplate),
            Self::JobListing => Arc::new(JobListingTemplate),
        }
    }
}
