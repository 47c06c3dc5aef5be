//! 纯文本回复：每个行为一行

use async_trait::async_trait;

use crate::policy::AgentAct;
use crate::session::ResponseGenerator;
use crate::state::DialogueState;

#[derive(Debug, Default, Clone)]
pub struct PlainResponder;

impl PlainResponder {
    pub fn render(act: &AgentAct) -> String {
        match act {
            AgentAct::Report { query, answer } => format!("{query}: {answer}"),
            AgentAct::AskForFieldConfirmation { field, value, .. } => {
                format!("Just to confirm, {field} is {value}?")
            }
            AgentAct::Say { utterance } => utterance.clone(),
            AgentAct::ProposeWorksheet {
                template,
                initial_values,
            } => {
                if initial_values.is_empty() {
                    format!("Would you like to start {template}?")
                } else {
                    let values: Vec<String> = initial_values
                        .iter()
                        .map(|(k, v)| format!("{k} {v}"))
                        .collect();
                    format!("Would you like to start {template} with {}?", values.join(", "))
                }
            }
            AgentAct::AskField {
                task,
                field,
                description,
            } => {
                if description.is_empty() {
                    format!("What is the {field} for {task}?")
                } else {
                    description.clone()
                }
            }
        }
    }
}

#[async_trait]
impl ResponseGenerator for PlainResponder {
    async fn respond(&self, acts: &[AgentAct], _state: &DialogueState) -> Result<String, String> {
        Ok(acts.iter().map(Self::render).collect::<Vec<_>>().join("\n"))
    }
}
