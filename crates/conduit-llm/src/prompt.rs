//! System prompt assembly
//!
//! A prompt is a fixed header, a mode block, the reuse policy, a context
//! block built from capped slots and optional user rules. The whole body is
//! capped again, then a session footer with the local time is appended.
//! Caps count characters, roughly four per token.

use std::collections::HashMap;
use std::fmt::Write as _;

use jiff::Zoned;
use serde::{Deserialize, Serialize};

use crate::types::ModelParams;

const HEADER: &str = "You are a senior software engineer working inside the user's editor. \
Answer precisely, prefer small verifiable steps, and use the available tools instead of guessing \
about files, symbols or command output.";

const REUSE_POLICY: &str = "Reuse before you rebuild: check the context below and the results of \
earlier tool calls before requesting the same information again. Do not re-read files or repeat \
searches whose results are already present unless they may have changed.";

const DEFAULT_BODY_CAP: usize = 24_000;
const ELLIPSIS: &str = "...";

/// Working mode, selects the mode block and default sampling
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Mode {
    /// Write and edit code
    #[default]
    Code,
    /// Produce a plan without editing
    Plan,
    /// Find and summarize information
    Search,
}

impl Mode {
    fn block(self) -> &'static str {
        match self {
            Self::Code => {
                "## Mode: code\nImplement the requested change. Read the relevant code first, keep edits \
minimal and consistent with the surrounding style, and explain what changed when you are done."
            }
            Self::Plan => {
                "## Mode: plan\nDo not modify files. Investigate as needed, then produce a numbered plan \
with concrete steps, the files each step touches, and the risks you see."
            }
            Self::Search => {
                "## Mode: search\nLocate the information the user asks for. Cite file paths and symbols, \
quote only the lines that matter, and say plainly when something could not be found."
            }
        }
    }

    /// Sampling defaults for the mode
    pub const fn model_params(self) -> ModelParams {
        let (temperature, top_p) = match self {
            Self::Code => (0.2, 0.95),
            Self::Plan => (0.4, 0.95),
            Self::Search => (0.1, 0.9),
        };
        ModelParams {
            max_tokens: None,
            temperature: Some(temperature),
            top_p: Some(top_p),
        }
    }
}

/// Named context section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Slot {
    TaskSummary,
    PlanOutline,
    PlanOutlineHash,
    CurrentFocus,
    ToolsContext,
    CodeContext,
    AvailableArtifacts,
    ExecutionGuidance,
}

impl Slot {
    /// Render order
    pub const ALL: [Self; 8] = [
        Self::TaskSummary,
        Self::PlanOutline,
        Self::PlanOutlineHash,
        Self::CurrentFocus,
        Self::ToolsContext,
        Self::CodeContext,
        Self::AvailableArtifacts,
        Self::ExecutionGuidance,
    ];

    /// Character cap when the caller sets none
    pub const fn default_cap(self) -> usize {
        match self {
            Self::TaskSummary | Self::ExecutionGuidance => 1200,
            Self::PlanOutline => 2000,
            Self::PlanOutlineHash => 128,
            Self::CurrentFocus => 800,
            Self::ToolsContext => 2400,
            Self::CodeContext => 8000,
            Self::AvailableArtifacts => 1600,
        }
    }

    const fn title(self) -> &'static str {
        match self {
            Self::TaskSummary => "Task summary",
            Self::PlanOutline => "Plan outline",
            Self::PlanOutlineHash => "Plan outline hash",
            Self::CurrentFocus => "Current focus",
            Self::ToolsContext => "Tools",
            Self::CodeContext => "Code",
            Self::AvailableArtifacts => "Available artifacts",
            Self::ExecutionGuidance => "Execution guidance",
        }
    }
}

/// Caller-supplied context for one prompt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptContext {
    pub slots: HashMap<Slot, String>,
    /// Per-slot cap overrides
    pub caps: HashMap<Slot, usize>,
    /// Body cap override
    pub body_cap: Option<usize>,
    /// Halve every cap and drop the reuse policy
    pub compact: bool,
}

impl PromptContext {
    #[must_use]
    pub fn with_slot(mut self, slot: Slot, text: impl Into<String>) -> Self {
        self.slots.insert(slot, text.into());
        self
    }

    #[must_use]
    pub fn with_cap(mut self, slot: Slot, cap: usize) -> Self {
        self.caps.insert(slot, cap);
        self
    }

    #[must_use]
    pub const fn compact(mut self) -> Self {
        self.compact = true;
        self
    }
}

/// Assembled system prompt and neutral sampling parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPack {
    pub system_prompt: String,
    pub model_params: ModelParams,
}

/// Builds [`PromptPack`]s
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    body_cap: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self {
            body_cap: DEFAULT_BODY_CAP,
        }
    }
}

impl PromptBuilder {
    /// Builder with a different default body cap
    pub const fn with_body_cap(body_cap: usize) -> Self {
        Self { body_cap }
    }

    /// Build a prompt stamped with the current local time
    pub fn build(&self, mode: Mode, custom_rules: Option<&str>, context: &PromptContext) -> PromptPack {
        self.build_at(mode, custom_rules, context, &Zoned::now())
    }

    /// Build a prompt stamped with `now`
    ///
    /// Identical inputs produce identical output.
    pub fn build_at(&self, mode: Mode, custom_rules: Option<&str>, context: &PromptContext, now: &Zoned) -> PromptPack {
        let shrink = |cap: usize| if context.compact { cap / 2 } else { cap };

        let mut sections = vec![HEADER.to_owned(), mode.block().to_owned()];
        if !context.compact {
            sections.push(REUSE_POLICY.to_owned());
        }

        let context_block = Slot::ALL
            .iter()
            .filter_map(|&slot| {
                let text = context.slots.get(&slot).map(|t| t.trim()).filter(|t| !t.is_empty())?;
                let cap = shrink(context.caps.get(&slot).copied().unwrap_or_else(|| slot.default_cap()));
                Some(format!("### {}\n{}", slot.title(), truncate(text, cap)))
            })
            .collect::<Vec<_>>();
        if !context_block.is_empty() {
            sections.push(format!("## Context\n\n{}", context_block.join("\n\n")));
        }

        let body_cap = shrink(context.body_cap.unwrap_or(self.body_cap));
        let mut system_prompt = truncate(&sections.join("\n\n"), body_cap);

        let zone = now.time_zone().iana_name().unwrap_or("UTC");
        let _ = write!(
            system_prompt,
            "\n\n## Session\nLocal time: {} ({zone})",
            now.strftime("%Y-%m-%d %H:%M:%S %:z")
        );

        // User rules follow the footer and are never clipped
        if let Some(rules) = custom_rules.map(str::trim).filter(|r| !r.is_empty()) {
            let _ = write!(system_prompt, "\n\n## User rules\n{rules}");
        }

        PromptPack {
            system_prompt,
            model_params: mode.model_params(),
        }
    }
}

/// Clip to `cap` characters, ending in `...` when clipped
pub fn truncate(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_owned();
    }

    let keep = cap.saturating_sub(ELLIPSIS.len());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(&ELLIPSIS[..cap.min(ELLIPSIS.len())]);
    out
}
