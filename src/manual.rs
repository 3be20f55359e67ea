//! Manual follow-up steps suggested by matched service rules.

use std::collections::HashSet;

use tracing::warn;

use crate::config::ManualEntry;
use crate::template::TemplateContext;

/// Global set of already-suggested manual commands.
#[derive(Debug, Default)]
pub struct ManualStepRecorder {
    seen: HashSet<String>,
}

impl ManualStepRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render `entries` with `ctx` and return the log text for commands not
    /// suggested before, one block per entry that gained at least one.
    ///
    /// A command whose template cannot be rendered is left out with a
    /// warning naming `rule`; its siblings are still recorded.
    pub fn record(&mut self, rule: &str, entries: &[ManualEntry], ctx: &TemplateContext) -> String {
        let mut out = String::new();
        for entry in entries {
            let mut block = format!("[*] {}\n", entry.description);
            let mut wrote = false;
            for template in &entry.commands {
                let command = match ctx.render(template) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(
                            rule,
                            description = %entry.description,
                            template = %template,
                            error = %e,
                            "skipping manual step"
                        );
                        continue;
                    }
                };
                if !self.seen.insert(command.clone()) {
                    continue;
                }
                block.push_str(&format!("\t{command}\n"));
                wrote = true;
            }
            if wrote {
                out.push_str(&block);
                out.push_str("\n\n");
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
