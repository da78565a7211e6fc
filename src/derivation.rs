//! Task derivation from proposal markdown
//!
//! Every bullet item (`- `, `* `, `+ `) becomes one task with an even share of
//! the proposal budget. A description without bullets yields a single
//! catch-all task covering the whole budget.

use chrono::Utc;

use crate::models::{MerkleProof, Proposal, Task, TaskStatus};

/// Extract bullet item texts from a markdown body, in order
pub fn bullet_items(markdown: &str) -> Vec<String> {
    markdown
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim_start();
            ["- ", "* ", "+ "]
                .iter()
                .find_map(|marker| trimmed.strip_prefix(marker))
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
        })
        .collect()
}

/// Derive task drafts for a proposal that has no explicit task list.
///
/// Each task carries a provisional proof funded from the proposal's
/// `funding_address`. Any budget remainder from the even split goes to the
/// first task so the shares always sum to the proposal budget.
pub fn derive_tasks_from_markdown(proposal: &Proposal) -> Vec<Task> {
    let items = bullet_items(&proposal.description_md);
    let contract_id = proposal.contract_id().to_string();

    let titles: Vec<String> = if items.is_empty() {
        vec![proposal.title.clone()]
    } else {
        items
    };

    let count = titles.len() as u64;
    let share = proposal.budget_sats / count;
    let remainder = proposal.budget_sats % count;
    let now = Utc::now();

    titles
        .into_iter()
        .enumerate()
        .map(|(index, title)| {
            let budget = if index == 0 { share + remainder } else { share };
            let mut task = Task::new(
                format!("{}-task-{}", proposal.id, index + 1),
                contract_id.clone(),
                title,
                budget,
            );
            if count == 1 {
                task.description = proposal.description_md.clone();
            }
            task.status = TaskStatus::Available;
            task.merkle_proof = Some(MerkleProof::provisional(
                proposal.metadata.funding_address.clone(),
                budget,
            ));
            task.created_at = now;
            task.updated_at = now;
            task
        })
        .collect()
}
