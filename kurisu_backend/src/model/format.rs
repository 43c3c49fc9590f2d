use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{Role, Turn};

/// Textual chat templates, named the way llama.cpp names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ChatFormat {
    #[default]
    #[serde(alias = "mistral")]
    MistralInstruct,
    Chatml,
    #[serde(alias = "llama-2")]
    Llama2,
    Gemma,
    Plain,
}

impl ChatFormat {
    /// Templates without a system role get system turns filtered out before rendering.
    pub fn supports_system_role(self) -> bool {
        !matches!(self, ChatFormat::MistralInstruct | ChatFormat::Gemma)
    }

    pub fn render(self, turns: &[Turn]) -> String {
        let turns: Vec<&Turn> = turns
            .iter()
            .filter(|turn| self.supports_system_role() || turn.role != Role::System)
            .collect();

        match self {
            ChatFormat::MistralInstruct => render_mistral(&turns),
            ChatFormat::Chatml => render_chatml(&turns),
            ChatFormat::Llama2 => render_llama2(&turns),
            ChatFormat::Gemma => render_gemma(&turns),
            ChatFormat::Plain => render_plain(&turns),
        }
    }
}

fn render_mistral(turns: &[&Turn]) -> String {
    let mut prompt = String::from("<s>");
    for turn in turns {
        match turn.role {
            Role::User => {
                prompt.push_str("[INST] ");
                prompt.push_str(&turn.content);
                prompt.push_str(" [/INST]");
            }
            Role::Assistant => {
                prompt.push_str(&turn.content);
                prompt.push_str("</s>");
            }
            Role::System => {}
        }
    }
    prompt
}

fn render_chatml(turns: &[&Turn]) -> String {
    let mut prompt = String::new();
    for turn in turns {
        prompt.push_str("<|im_start|>");
        prompt.push_str(turn.role.as_str());
        prompt.push('\n');
        prompt.push_str(&turn.content);
        prompt.push_str("<|im_end|>\n");
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

fn render_llama2(turns: &[&Turn]) -> String {
    let mut prompt = String::new();
    let mut pending_system: Option<&str> = None;
    for turn in turns {
        match turn.role {
            Role::System => pending_system = Some(&turn.content),
            Role::User => {
                prompt.push_str("<s>[INST] ");
                if let Some(system) = pending_system.take() {
                    prompt.push_str("<<SYS>>\n");
                    prompt.push_str(system);
                    prompt.push_str("\n<</SYS>>\n\n");
                }
                prompt.push_str(&turn.content);
                prompt.push_str(" [/INST]");
            }
            Role::Assistant => {
                prompt.push(' ');
                prompt.push_str(&turn.content);
                prompt.push_str(" </s>");
            }
        }
    }
    if let Some(system) = pending_system {
        // A history holding only the persona still has to be counted.
        prompt.push_str("<s>[INST] <<SYS>>\n");
        prompt.push_str(system);
        prompt.push_str("\n<</SYS>>\n\n [/INST]");
    }
    prompt
}

fn render_gemma(turns: &[&Turn]) -> String {
    let mut prompt = String::from("<bos>");
    for turn in turns {
        let role = match turn.role {
            Role::Assistant => "model",
            _ => "user",
        };
        prompt.push_str("<start_of_turn>");
        prompt.push_str(role);
        prompt.push('\n');
        prompt.push_str(&turn.content);
        prompt.push_str("<end_of_turn>\n");
    }
    prompt.push_str("<start_of_turn>model\n");
    prompt
}

fn render_plain(turns: &[&Turn]) -> String {
    let mut prompt = String::new();
    for turn in turns {
        prompt.push_str(turn.role.as_str());
        prompt.push_str(": ");
        prompt.push_str(&turn.content);
        prompt.push('\n');
    }
    prompt.push_str("assistant:");
    prompt
}

impl fmt::Display for ChatFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChatFormat::MistralInstruct => "mistral-instruct",
            ChatFormat::Chatml => "chatml",
            ChatFormat::Llama2 => "llama-2",
            ChatFormat::Gemma => "gemma",
            ChatFormat::Plain => "plain",
        };
        f.write_str(name)
    }
}

impl FromStr for ChatFormat {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mistral-instruct" | "mistral" => Ok(ChatFormat::MistralInstruct),
            "chatml" => Ok(ChatFormat::Chatml),
            "llama-2" | "llama2" => Ok(ChatFormat::Llama2),
            "gemma" => Ok(ChatFormat::Gemma),
            "plain" => Ok(ChatFormat::Plain),
            other => Err(anyhow::anyhow!("Unknown chat format '{}'", other)),
        }
    }
}
