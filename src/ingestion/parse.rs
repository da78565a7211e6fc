//! Payload parsing for ingestion records
//!
//! A record payload is either a structured contract+tasks JSON document or a
//! free-form markdown wish. Payloads wrapped in a `{"message", "address",
//! "price"}` envelope are unwrapped first.

use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::MarketError;
use crate::models::{Contract, MerkleProof, Proposal, Task};

use super::IngestionRecord;

/// Envelope keys flattened into proposal metadata
const ENVELOPE_KEYS: [&str; 3] = ["message", "address", "price"];

/// Working text plus any metadata lifted out of an envelope
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedPayload {
    pub text: String,
    pub metadata: Map<String, Value>,
}

impl NormalizedPayload {
    pub fn funding_address(&self) -> Option<String> {
        self.metadata
            .get("address")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    /// `price` in sats, accepted as a JSON number or a numeric string
    pub fn price_sats(&self) -> Option<u64> {
        match self.metadata.get("price")? {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// A contract with the pending proposal competing to become its plan
#[derive(Debug, Clone)]
pub struct IngestedPlan {
    pub contract: Contract,
    pub proposal: Proposal,
}

/// Unwrap a message envelope. Anything that is not an envelope object is
/// used verbatim as the working text.
pub fn normalize_payload(raw: &str) -> NormalizedPayload {
    let envelope = match serde_json::from_str::<Value>(raw.trim()) {
        Ok(Value::Object(map))
            if !map.contains_key("tasks") && ENVELOPE_KEYS.iter().any(|k| map.contains_key(*k)) =>
        {
            map
        }
        _ => {
            return NormalizedPayload {
                text: raw.to_string(),
                metadata: Map::new(),
            }
        }
    };

    let mut metadata = Map::new();
    let mut text = String::new();
    for (key, value) in envelope {
        if key == "message" {
            text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
        } else {
            metadata.insert(key, value);
        }
    }
    NormalizedPayload { text, metadata }
}

/// `wish-` plus the first 16 hex chars of SHA-256 over the seed
pub fn wish_id(seed: &str) -> String {
    let digest = hex::encode(Sha256::digest(seed.as_bytes()));
    format!("wish-{}", &digest[..16])
}

#[derive(Debug, Deserialize)]
struct StructuredDoc {
    #[serde(default)]
    contract: Option<ContractDoc>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    budget_sats: Option<u64>,
    tasks: Vec<TaskDoc>,
}

#[derive(Debug, Default, Deserialize)]
struct ContractDoc {
    #[serde(default)]
    contract_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    budget_sats: Option<u64>,
    #[serde(default)]
    skills: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TaskDoc {
    #[serde(default)]
    task_id: Option<String>,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    budget_sats: u64,
    #[serde(default)]
    skills: Vec<String>,
}

/// Try the structured document form. `None` means "not structured, or no
/// tasks", and the caller should fall back to the markdown wish.
pub fn parse_structured(
    payload: &NormalizedPayload,
    record: &IngestionRecord,
    visible_pixel_hash: Option<&str>,
) -> Option<IngestedPlan> {
    let doc: StructuredDoc = serde_json::from_str(payload.text.trim()).ok()?;
    if doc.tasks.is_empty() {
        return None;
    }
    let contract_doc = doc.contract.unwrap_or_default();

    let contract_id = contract_doc
        .contract_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| wish_id(&record.payload));
    let title = contract_doc
        .title
        .or(doc.title)
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| contract_id.clone());
    let task_total: u64 = doc.tasks.iter().map(|t| t.budget_sats).sum();
    let budget = contract_doc
        .budget_sats
        .or(doc.budget_sats)
        .unwrap_or(task_total);
    let funding_address = payload.funding_address();
    let attach_proof = funding_address.is_some() || visible_pixel_hash.is_some();

    let tasks: Vec<Task> = doc
        .tasks
        .into_iter()
        .enumerate()
        .map(|(index, draft)| {
            let task_id = draft
                .task_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("{}-task-{}", contract_id, index + 1));
            let mut task = Task::new(task_id, contract_id.clone(), draft.title, draft.budget_sats);
            task.description = draft.description;
            task.skills = draft.skills;
            if attach_proof {
                task.merkle_proof = Some(MerkleProof::provisional(
                    funding_address.clone(),
                    draft.budget_sats,
                ));
            }
            task
        })
        .collect();

    let mut contract = Contract::new(contract_id.clone(), title.clone(), budget);
    contract.skills = contract_doc.skills;
    contract.goals_count = tasks.len() as u32;
    contract.creator_api_key_hash = record.creator_api_key_hash.clone();
    contract.funding_address = funding_address.clone();

    let mut proposal = Proposal::new(format!("proposal-{}", contract_id), title, budget);
    proposal.description_md = doc.description.unwrap_or_default();
    proposal.visible_pixel_hash = visible_pixel_hash.map(str::to_string);
    proposal.tasks = tasks;
    proposal.metadata.contract_id = Some(contract_id);
    proposal.metadata.creator_api_key_hash = record.creator_api_key_hash.clone();
    proposal.metadata.funding_address = funding_address;
    proposal.metadata.extra = payload.metadata.clone();

    Some(IngestedPlan { contract, proposal })
}

/// Title from the first markdown heading, else the first non-empty line
pub fn wish_title(markdown: &str) -> Option<String> {
    let lines = || markdown.lines().map(str::trim).filter(|l| !l.is_empty());
    lines()
        .find(|l| l.starts_with('#'))
        .map(|l| l.trim_start_matches('#').trim().to_string())
        .filter(|t| !t.is_empty())
        .or_else(|| lines().next().map(str::to_string))
}

/// Build the wish contract and its single pending proposal. Task drafts are
/// left empty and derived from the markdown bullets when the proposal is stored.
pub fn parse_markdown_wish(
    payload: &NormalizedPayload,
    record: &IngestionRecord,
    visible_pixel_hash: Option<&str>,
) -> Result<IngestedPlan, MarketError> {
    let title = wish_title(&payload.text)
        .ok_or_else(|| MarketError::Ingestion("wish has no text".to_string()))?;
    let budget = payload.price_sats().unwrap_or(0);

    let seed = if record.payload.trim().is_empty() {
        record.image_base64.as_deref().unwrap_or_default()
    } else {
        record.payload.as_str()
    };
    let contract_id = wish_id(seed);
    let funding_address = payload.funding_address();

    let mut contract = Contract::new(contract_id.clone(), title.clone(), budget);
    contract.creator_api_key_hash = record.creator_api_key_hash.clone();
    contract.funding_address = funding_address.clone();

    let mut proposal = Proposal::new(format!("proposal-{}", contract_id), title, budget);
    proposal.description_md = payload.text.clone();
    proposal.visible_pixel_hash = visible_pixel_hash.map(str::to_string);
    proposal.metadata.contract_id = Some(contract_id);
    proposal.metadata.creator_api_key_hash = record.creator_api_key_hash.clone();
    proposal.metadata.funding_address = funding_address;
    proposal.metadata.extra = payload.metadata.clone();

    Ok(IngestedPlan { contract, proposal })
}
