//! Skill loading: markdown documents from the configured directories,
//! filtered by the enabled list and concatenated under a character budget.

use std::path::PathBuf;

use ab_domain::config::SkillsConfig;

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub body: String,
}

pub struct SkillSet {
    skills: Vec<Skill>,
    max_chars: usize,
}

impl SkillSet {
    pub fn load(cfg: &SkillsConfig) -> Self {
        let mut skills = Vec::new();
        for name in &cfg.enabled {
            match find_skill(&cfg.dirs, name) {
                Some(path) => match std::fs::read_to_string(&path) {
                    Ok(body) => {
                        skills.push(Skill {
                            name: name.clone(),
                            body,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(skill = %name, error = %e, "failed to read skill");
                    }
                },
                None => {
                    tracing::debug!(skill = %name, "skill not found in any configured dir");
                }
            }
        }
        tracing::info!(loaded = skills.len(), "skills loaded");
        Self {
            skills,
            max_chars: cfg.max_chars,
        }
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// The prompt section: skill bodies in enable order, cut off at the
    /// character budget.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for skill in &self.skills {
            if out.len() >= self.max_chars {
                break;
            }
            let remaining = self.max_chars - out.len();
            let header = format!("## Skill: {}\n", skill.name);
            out.push_str(&header);
            if skill.body.len() <= remaining {
                out.push_str(&skill.body);
            } else {
                let cut: String = skill.body.chars().take(remaining).collect();
                out.push_str(&cut);
            }
            out.push('\n');
        }
        out
    }
}

fn find_skill(dirs: &[PathBuf], name: &str) -> Option<PathBuf> {
    for dir in dirs {
        let candidate = dir.join(format!("{name}.md"));
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}
