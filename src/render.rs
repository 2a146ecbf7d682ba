use crate::core::task::Status;
use crate::core::tracker::{NodeView, TreeSnapshot};
use crate::diagnostics::DiagnosticEntry;
use crate::session::{Phase, RunId, Session};
use std::fmt::Write;

/// Terminal glyph for a status icon name.
pub fn glyph(status: &Status) -> &'static str {
    match status.icon() {
        "flat-arrow" => "→",
        "sync" => "↻",
        "check" => "✓",
        _ => "✗",
    }
}

/// Everything a presentation layer needs for one frame.
#[derive(Debug, Clone, Default)]
pub struct RenderState {
    pub run: Option<RunId>,
    pub phase: Phase,
    pub tree: TreeSnapshot,
    pub diagnostics: Vec<DiagnosticEntry>,
}

impl RenderState {
    pub fn capture(session: &Session) -> Self {
        let state = session.state();
        Self {
            run: state.run,
            phase: state.phase,
            tree: session.tree(),
            diagnostics: session.diagnostics().entries(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let run = self.run.map(|r| r.short()).unwrap_or_else(|| "-".into());
        let _ = writeln!(out, "run {} [{}]", run, self.phase);
        out.push_str(&render_tree(&self.tree));
        if !self.diagnostics.is_empty() {
            out.push_str(&render_diagnostics(&self.diagnostics));
        }
        out
    }
}

/// Remembers the last tree version drawn, so a watcher redraws only on change.
#[derive(Debug, Default)]
pub struct Frames {
    drawn: Option<u64>,
}

impl Frames {
    /// Render `snapshot` unless its version was already drawn.
    pub fn frame(&mut self, snapshot: &TreeSnapshot) -> Option<String> {
        if self.drawn == Some(snapshot.version) {
            return None;
        }
        self.drawn = Some(snapshot.version);
        Some(render_tree(snapshot))
    }
}

/// Draw the tree with box-drawing connectors, one node per line.
pub fn render_tree(snapshot: &TreeSnapshot) -> String {
    let mut out = String::new();
    if let Some(root) = &snapshot.root {
        write_node(&mut out, root, "", None);
    }
    out
}

fn write_node(out: &mut String, node: &NodeView, prefix: &str, last: Option<bool>) {
    let (branch, child_prefix) = match last {
        None => ("", String::new()),
        Some(true) => ("└─ ", format!("{}   ", prefix)),
        Some(false) => ("├─ ", format!("{}│  ", prefix)),
    };
    let _ = write!(out, "{}{}{} {}", prefix, branch, glyph(&node.status), node.label);
    if let Some(detail) = &node.detail {
        let _ = write!(out, "  {}", detail);
    }
    if node.attempts > 1 {
        let _ = write!(out, "  (attempt {})", node.attempts);
    }
    if let Some(failure) = node.status.failure() {
        let _ = write!(out, "  [{}]", failure);
    }
    out.push('\n');

    let count = node.children.len();
    for (i, child) in node.children.iter().enumerate() {
        write_node(out, child, &child_prefix, Some(i + 1 == count));
    }
}

pub fn render_diagnostics(entries: &[DiagnosticEntry]) -> String {
    let mut out = String::from("diagnostics:\n");
    for entry in entries {
        let _ = writeln!(out, "  {} {}", entry.at.format("%H:%M:%S%.3f"), entry);
    }
    out
}
