//! OpenAI-compatible chat completions as the extraction collaborator.
//!
//! Works with any service implementing `/chat/completions` with JSON output.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{EndpointResolver, ExtractionRequest, RawShowCandidate, ShowExtractor};
use crate::config::ExtractionSettings;
use crate::error::ExtractionError;
use crate::sources::SourceKind;

pub struct LlmExtractor {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    temperature: f32,
}

impl LlmExtractor {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            timeout: Duration::from_secs(120),
            temperature: 0.0,
        }
    }

    /// The key is read from the environment variable the settings name; a
    /// missing key is allowed for local servers.
    pub fn from_settings(settings: &ExtractionSettings) -> Self {
        let api_key = std::env::var(&settings.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        let mut extractor = Self::new(&settings.base_url, &settings.model, api_key);
        extractor.timeout = Duration::from_secs(settings.timeout_secs);
        extractor.temperature = settings.temperature;
        extractor
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String, ExtractionError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        debug!(model = %self.model, chars = user.len(), "Sending extraction request");

        let mut req_builder = self.client.post(&url).json(&request);
        if let Some(api_key) = &self.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req_builder
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExtractionError::Timeout
                } else {
                    ExtractionError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ExtractionError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            ExtractionError::InvalidResponse(format!("Failed to parse completion: {}", e))
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExtractionError::InvalidResponse("No content in completion".into()))
    }

    async fn ask_url(&self, question: &str) -> Result<Option<String>, ExtractionError> {
        let system = "You know the web presence of music artists. Answer with a JSON object \
                      {\"url\": string or null}. Use null when you are not sure the page exists.";
        let content = self.chat(system, question).await?;
        let value = parse_json(&content)?;
        Ok(value
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
            .map(String::from))
    }
}

fn system_prompt(request: &ExtractionRequest<'_>) -> String {
    let origin = match request.source_kind {
        SourceKind::ArtistWebsite => format!(
            "a page from the official website of the artist \"{}\"",
            request.artist_name
        ),
        SourceKind::ListingSite => format!(
            "the concert listings page of the artist \"{}\". The page is split into \
             upcoming and past concerts; set \"section\" to \"upcoming\" or \"past\" accordingly",
            request.artist_name
        ),
        SourceKind::Newsletter => format!(
            "newsletter emails sent by the artist \"{}\", separated by lines of ---",
            request.artist_name
        ),
        SourceKind::Inbox => format!("an email about the artist \"{}\"", request.artist_name),
    };

    let mut prompt = format!(
        "You extract concert dates from {origin}.\n\
         Today is {today}.\n\
         Return a JSON object {{\"shows\": [...]}} where each show has: \
         \"date\" (YYYY-MM-DD when the year is stated, otherwise the date exactly as written), \
         \"city\", \"state\", \"country\", \"country_code\" (ISO 3166-1 alpha-2), \"venue\", \
         \"source_url\" (the link the show came from, if any), \"section\".\n\
         Use null for unknown fields. Never invent a year or a date that the text does not state; \
         leave out shows without a date. If there are no shows, return {{\"shows\": []}}.",
        today = request.reference_date.format("%Y-%m-%d"),
    );
    if !request.known_venues.is_empty() {
        prompt.push_str(&format!(
            "\nVenues already on record for this artist (reuse these spellings): {}.",
            request.known_venues.join(", ")
        ));
    }
    prompt
}

/// Completions sometimes wrap JSON in a markdown fence.
fn parse_json(content: &str) -> Result<Value, ExtractionError> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(unfenced.trim())
        .map_err(|e| ExtractionError::InvalidResponse(format!("not JSON: {}", e)))
}

/// `{"shows": [...]}` or a bare array. Malformed entries are dropped.
fn parse_shows(content: &str) -> Result<Vec<RawShowCandidate>, ExtractionError> {
    let value = parse_json(content)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("shows") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(ExtractionError::InvalidResponse(format!(
                    "\"shows\" is not a list: {}",
                    other
                )))
            }
        },
        other => {
            return Err(ExtractionError::InvalidResponse(format!(
                "unexpected response: {}",
                other
            )))
        }
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<RawShowCandidate>(item) {
            Ok(c) if !c.date.to_string().trim().is_empty() && !c.city.trim().is_empty() => Some(c),
            Ok(_) => None,
            Err(e) => {
                debug!("Dropping malformed show: {}", e);
                None
            }
        })
        .collect())
}

#[async_trait]
impl ShowExtractor for LlmExtractor {
    async fn extract(
        &self,
        request: &ExtractionRequest<'_>,
    ) -> Result<Vec<RawShowCandidate>, ExtractionError> {
        let content = self.chat(&system_prompt(request), request.text).await?;
        let shows = parse_shows(&content)?;
        debug!(artist = %request.artist_name, shows = shows.len(), "Extraction finished");
        Ok(shows)
    }

    async fn identify_artist(
        &self,
        text: &str,
        known_artists: &[String],
    ) -> Result<Option<String>, ExtractionError> {
        let system = format!(
            "You read emails from music artist newsletters and mailing lists. \
             Identify the single artist the email is about. If it matches one of the \
             known artists, use the known spelling exactly. Known artists: {}.\n\
             Return a JSON object {{\"artist\": string or null}}.",
            if known_artists.is_empty() {
                "none".to_string()
            } else {
                known_artists.join(", ")
            }
        );
        let value = parse_json(&self.chat(&system, text).await?)?;
        Ok(value
            .get("artist")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(|a| {
                known_artists
                    .iter()
                    .find(|k| k.eq_ignore_ascii_case(a))
                    .cloned()
                    .unwrap_or_else(|| a.to_string())
            }))
    }
}

#[async_trait]
impl EndpointResolver for LlmExtractor {
    async fn find_official_site(
        &self,
        artist_name: &str,
    ) -> Result<Option<String>, ExtractionError> {
        self.ask_url(&format!(
            "What is the official website of the music artist '{}'?",
            artist_name
        ))
        .await
    }

    async fn find_listing_page(
        &self,
        artist_name: &str,
    ) -> Result<Option<String>, ExtractionError> {
        self.ask_url(&format!(
            "What is the Songkick page of the music artist '{}'? \
             It has the form https://www.songkick.com/artists/<id>-<artist-name>.",
            artist_name
        ))
        .await
    }
}

// Chat completions API types

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}
