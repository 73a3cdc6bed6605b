//! System prompt assembly: identity, memory packet sections, skills, and
//! operator-provided extra instructions, gated by the `prompts` config.

use ab_memory::MemoryPacket;

use crate::state::AppState;

const IDENTITY: &str = "You are Agent Blob, a helpful always-on master AI. \
Be concise and actionable. Use tools when they get a better answer than \
guessing; respect every permission decision without arguing.";

pub fn build_system_prompt(state: &AppState, packet: &MemoryPacket) -> String {
    let cfg = &state.config.prompts;
    let mut sections: Vec<String> = Vec::new();

    if cfg.include_identity {
        sections.push(IDENTITY.to_string());
    }

    if cfg.include_memory {
        if !packet.pinned.is_empty() {
            let mut s = String::from("Pinned memory (authoritative):\n");
            for item in &packet.pinned {
                s.push_str("- ");
                s.push_str(&item.text);
                s.push('\n');
            }
            sections.push(s);
        }
        if !packet.items.is_empty() {
            let mut s = String::from("Potentially relevant past notes (may be partial):\n");
            for item in &packet.items {
                s.push_str(&format!("- [{}] {}\n", item.kind, item.text));
            }
            sections.push(s);
        }
        if !packet.related_turns.is_empty() {
            let mut s = String::from("Related earlier exchanges:\n");
            for turn in &packet.related_turns {
                s.push_str(&format!(
                    "- user: {} / assistant: {}\n",
                    truncate(&turn.user_text, 160),
                    truncate(&turn.assistant_text, 160),
                ));
            }
            sections.push(s);
        }
    }

    if cfg.include_skills {
        let skills = state.skills.render();
        if !skills.is_empty() {
            sections.push(skills);
        }
    }

    if let Some(extra) = &cfg.extra_instructions {
        if !extra.trim().is_empty() {
            sections.push(extra.clone());
        }
    }

    sections.join("\n\n")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}…")
    }
}
