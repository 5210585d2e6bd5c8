//! Terminal selection surface for a triage session.

use anyhow::Result;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{MultiSelect, Select};
use std::path::Path;

use crate::core::catalog::{CatalogEntry, DirectoryStats};
use crate::core::triage::{EntryRef, Triage, TriageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Next,
    Previous,
    Move,
    Undo,
    Quit,
}

impl Action {
    fn label(self) -> &'static str {
        match self {
            Action::Next => "Next cluster",
            Action::Previous => "Previous cluster",
            Action::Move => "Pick files to move",
            Action::Undo => "Undo last move",
            Action::Quit => "Quit",
        }
    }
}

/// Counts for the end of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub moved: usize,
    pub undone: usize,
}

/// One line per entry: directory relative to `root`, name, shape, diff
/// and how much of that directory ended up clustered.
pub fn entry_label(entry: &CatalogEntry, root: &Path, stats: &DirectoryStats) -> String {
    let dir = entry.parent();
    let rel = dir
        .strip_prefix(root)
        .ok()
        .filter(|r| !r.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let name = entry
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut label = format!("{}/{}", rel.display(), name);
    if entry.target {
        label.insert_str(0, "🏆 ");
    }
    if let Some(shape) = entry.shape {
        label.push_str(&format!(
            "  {}x{}x{}",
            shape.height, shape.width, shape.channels
        ));
    }
    if let Some(diff) = entry.diff {
        label.push_str(&format!("  diff {diff:.3}"));
    }
    if let Some(count) = stats.get(dir) {
        label.push_str(&format!("  [{}/{} dup]", count.duplicates, count.total));
    }
    label
}

fn pick_action(theme: &ColorfulTheme, prompt: &str, actions: &[Action]) -> Result<Action> {
    let labels: Vec<&str> = actions.iter().map(|a| a.label()).collect();
    let choice = Select::with_theme(theme)
        .with_prompt(prompt)
        .items(&labels)
        .default(0)
        .interact_opt()?;
    Ok(choice.map_or(Action::Quit, |i| actions[i]))
}

/// Walk the active clusters until the operator quits.
pub fn run_session(triage: &mut Triage, root: &Path, stats: &DirectoryStats) -> Result<SessionSummary> {
    let theme = ColorfulTheme::default();
    let mut summary = SessionSummary::default();
    let mut position = 0usize;

    loop {
        let active = triage.active();

        let action = if active.is_empty() {
            println!("\n✅ No clusters left to review.");
            if triage.records().is_empty() {
                break;
            }
            pick_action(&theme, "Anything else?", &[Action::Undo, Action::Quit])?
        } else {
            position = position.min(active.len() - 1);
            let cluster_index = active[position];
            let cluster = &triage.clusters()[cluster_index];

            println!(
                "\n✨ Cluster {}/{} ({} files)",
                position + 1,
                active.len(),
                cluster.len()
            );
            for entry in cluster.iter() {
                println!("   {}", entry_label(entry, root, stats));
            }

            let action = pick_action(
                &theme,
                "What next?",
                &[
                    Action::Next,
                    Action::Previous,
                    Action::Move,
                    Action::Undo,
                    Action::Quit,
                ],
            )?;

            if action == Action::Move {
                let labels: Vec<String> = cluster
                    .iter()
                    .map(|e| entry_label(e, root, stats))
                    .collect();
                let picked = MultiSelect::with_theme(&theme)
                    .with_prompt("Space to mark, Enter to move")
                    .items(&labels)
                    .interact_opt()?
                    .unwrap_or_default();

                let selection: Vec<EntryRef> = picked
                    .into_iter()
                    .map(|entry| EntryRef::new(cluster_index, entry))
                    .collect();
                for applied in triage.perform(&selection)? {
                    summary.moved += 1;
                    println!(
                        "   📦 Moved {} → {}",
                        applied.source.display(),
                        applied.destination.display()
                    );
                }
            }

            match action {
                Action::Next => position = (position + 1) % active.len(),
                Action::Previous => position = (position + active.len() - 1) % active.len(),
                _ => {}
            }
            action
        };

        match action {
            Action::Undo => match triage.undo() {
                Ok(Some(reversed)) if reversed.restored => {
                    summary.undone += 1;
                    println!(
                        "   🔄 Restored {} → {}",
                        reversed.destination.display(),
                        reversed.source.display()
                    );
                }
                Ok(Some(reversed)) => {
                    summary.undone += 1;
                    println!(
                        "   ⚠️  {} was gone; dropped it from the ledger",
                        reversed.destination.display()
                    );
                }
                Ok(None) => println!("   Nothing to undo."),
                Err(TriageError::Occupied { path }) => {
                    println!("   ⚠️  {} is occupied; clear it and undo again", path.display());
                }
                Err(err) => return Err(err.into()),
            },
            Action::Quit => break,
            _ => {}
        }
    }

    Ok(summary)
}
