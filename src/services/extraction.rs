use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{ServiceError, ServiceResult, ValidationError};
use crate::models::{CostClassification, ExtractedInvoiceData, InvoiceCandidate};
use crate::services::rate_limiter::{ApiFamily, RateLimiter};
use crate::utils::{normalize_date, normalize_supplier, year_of};

const SERVICE: &str = "extraction";
const DEFAULT_DOCUMENT_TYPE: &str = "fatura";

/// Turns raw document bytes into structured invoice fields.
#[async_trait]
pub trait ExtractionOracle: Send + Sync {
    async fn extract(&self, bytes: &[u8], mime_type: &str) -> ServiceResult<ExtractedInvoiceData>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<Message>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: Value,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// OpenAI-compatible chat completions endpoint with vision input.
pub struct OpenAiExtractor {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    limiter: Arc<RateLimiter>,
}

impl OpenAiExtractor {
    pub fn new(
        client: reqwest::Client,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            limiter,
        }
    }

    async fn call(&self, messages: Vec<Message>) -> ServiceResult<String> {
        let request = ChatRequest {
            model: &self.model,
            temperature: 0.1,
            messages,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        self.limiter.wait_for_slot(ApiFamily::Extraction).await;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|source| ServiceError::Transport {
                service: SERVICE,
                source,
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status {
                service: SERVICE,
                status,
                body,
            });
        }

        let body: ChatResponse = response.json().await.map_err(|e| ServiceError::Decode {
            service: SERVICE,
            reason: e.to_string(),
        })?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .ok_or_else(|| ServiceError::Decode {
                service: SERVICE,
                reason: "empty response".to_string(),
            })
    }
}

#[async_trait]
impl ExtractionOracle for OpenAiExtractor {
    #[tracing::instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn extract(&self, bytes: &[u8], mime_type: &str) -> ServiceResult<ExtractedInvoiceData> {
        let schema = extraction_schema()?;
        let system = Message {
            role: "system",
            content: Value::String(system_prompt().to_string()),
        };
        let user = Message {
            role: "user",
            content: document_content(bytes, mime_type),
        };

        let raw = self.call(vec![system, user]).await?;
        let value = match parse_json(&raw) {
            Ok(value) if schema.is_valid(&value) => value,
            _ => {
                tracing::debug!("Extraction output off-schema, asking for a fix");
                let fix = Message {
                    role: "user",
                    content: Value::String(format!(
                        "Corrige este JSON para respeitar exatamente o esquema. \
                         Responde apenas com JSON. JSON:\n{}",
                        raw
                    )),
                };
                let system = Message {
                    role: "system",
                    content: Value::String(system_prompt().to_string()),
                };
                let fixed = self.call(vec![system, fix]).await?;
                let value = parse_json(&fixed)?;
                if !schema.is_valid(&value) {
                    return Err(ServiceError::Decode {
                        service: SERVICE,
                        reason: "JSON validation failed".to_string(),
                    });
                }
                value
            }
        };

        let mut data: ExtractedInvoiceData =
            serde_json::from_value(value).map_err(|e| ServiceError::Decode {
                service: SERVICE,
                reason: e.to_string(),
            })?;
        if data.confidence.is_none() {
            data.confidence = Some(compute_confidence(&data));
        }
        Ok(data)
    }
}

fn document_content(bytes: &[u8], mime_type: &str) -> Value {
    let data_url = format!("data:{};base64,{}", mime_type, general_purpose::STANDARD.encode(bytes));
    let document = if mime_type.starts_with("image/") {
        json!({ "type": "image_url", "image_url": { "url": data_url } })
    } else {
        json!({ "type": "file", "file": { "filename": "document.pdf", "file_data": data_url } })
    };
    json!([
        { "type": "text", "text": "Extrai os dados desta fatura." },
        document
    ])
}

/// Drops markdown code fences the model sometimes wraps its JSON in.
pub fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn parse_json(raw: &str) -> ServiceResult<Value> {
    serde_json::from_str::<Value>(strip_fences(raw)).map_err(|e| ServiceError::Decode {
        service: SERVICE,
        reason: format!("Invalid JSON: {}", e),
    })
}

fn extraction_schema() -> ServiceResult<JSONSchema> {
    let schema = json!({
        "type": "object",
        "required": ["supplier_name", "doc_date", "total_amount"],
        "properties": {
            "document_type": {"type": ["string", "null"]},
            "cost_classification": {"type": ["string", "null"]},
            "doc_date": {"type": ["string", "null"]},
            "doc_year": {"type": ["integer", "null"]},
            "supplier_name": {"type": ["string", "null"]},
            "supplier_tax_id": {"type": ["string", "null"]},
            "doc_number": {"type": ["string", "null"]},
            "total_amount": {"type": ["number", "null"]},
            "tax_amount": {"type": ["number", "null"]},
            "summary": {"type": ["string", "null"]},
            "confidence": {"type": ["number", "null"], "minimum": 0, "maximum": 100}
        }
    });
    JSONSchema::compile(&schema)
        .map_err(|e| ServiceError::other(SERVICE, format!("Invalid JSON schema: {}", e)))
}

fn compute_confidence(data: &ExtractedInvoiceData) -> f64 {
    let mut score: f64 = 40.0;
    if data.doc_number.is_some() {
        score += 10.0;
    }
    if data.doc_date.is_some() {
        score += 10.0;
    }
    if data.supplier_name.is_some() {
        score += 10.0;
    }
    if data.total_amount.is_some() {
        score += 10.0;
    }
    if data.supplier_tax_id.is_some() {
        score += 10.0;
    }
    if data.tax_amount.is_some() {
        score += 5.0;
    }
    score.clamp(0.0, 100.0)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Validates and normalizes oracle output. Supplier, date and amount are mandatory.
pub fn to_candidate(data: ExtractedInvoiceData) -> Result<InvoiceCandidate, ValidationError> {
    let supplier_name = non_blank(data.supplier_name)
        .map(|s| normalize_supplier(&s))
        .ok_or(ValidationError::IncompleteExtraction("supplier_name"))?;
    let doc_date = normalize_date(data.doc_date)
        .ok_or(ValidationError::IncompleteExtraction("doc_date"))?;
    let total_amount = data
        .total_amount
        .ok_or(ValidationError::IncompleteExtraction("total_amount"))?;
    if !total_amount.is_finite() {
        return Err(ValidationError::InvalidField {
            field: "total_amount",
            reason: total_amount.to_string(),
        });
    }

    let doc_year = year_of(&doc_date).ok_or_else(|| ValidationError::InvalidField {
        field: "doc_date",
        reason: doc_date.clone(),
    })?;
    if let Some(reported) = data.doc_year {
        if reported != doc_year {
            tracing::debug!(
                reported,
                derived = doc_year,
                "Oracle year disagrees with date, using date"
            );
        }
    }

    let confidence = data.confidence.unwrap_or(0.0);
    let confidence_score = if confidence.is_finite() {
        confidence.round().clamp(0.0, 100.0) as u8
    } else {
        0
    };

    Ok(InvoiceCandidate {
        document_type: non_blank(data.document_type)
            .unwrap_or_else(|| DEFAULT_DOCUMENT_TYPE.to_string()),
        cost_classification: data
            .cost_classification
            .as_deref()
            .and_then(CostClassification::parse),
        doc_date,
        doc_year,
        supplier_name,
        supplier_tax_id: non_blank(data.supplier_tax_id),
        doc_number: non_blank(data.doc_number),
        total_amount,
        tax_amount: data.tax_amount.filter(|t| t.is_finite()),
        summary: non_blank(data.summary),
        confidence_score,
    })
}

fn system_prompt() -> &'static str {
    r#"És um sistema de extração de faturas portuguesas. Devolve apenas JSON com este esquema.
Campos:
- document_type (string|null, ex. "fatura", "fatura-recibo", "recibo")
- cost_classification ("fixed"|"variable"|null)
- doc_date (YYYY-MM-DD|null)
- doc_year (integer|null)
- supplier_name (string|null)
- supplier_tax_id (string|null, NIF)
- doc_number (string|null)
- total_amount (number|null)
- tax_amount (number|null, IVA)
- summary (string|null, descrição curta)
- confidence (number 0-100|null)
"#
}
