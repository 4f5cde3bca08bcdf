//! Answering pending questions from the terminal.

use anyhow::Result;
use dialoguer::{MultiSelect, Select, theme::ColorfulTheme};
use indicatif::MultiProgress;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::QuestionBroker;
use crate::events::LifecycleEvent;
use crate::shutdown::ShutdownFlag;
use crate::state::{Answers, PendingQuestion, QuestionItem};

/// Separator between labels of a multi-select answer.
pub const MULTI_SELECT_SEPARATOR: &str = ", ";

/// Build the answer map for a question, asking `choose` for the selected
/// option indices of each item.
pub fn collect_answers<F>(question: &PendingQuestion, mut choose: F) -> Result<Answers>
where
    F: FnMut(&QuestionItem) -> Result<Vec<usize>>,
{
    let mut answers = Answers::new();
    for item in &question.questions {
        let labels: Vec<&str> = choose(item)?
            .into_iter()
            .filter_map(|i| item.options.get(i))
            .map(|o| o.label.as_str())
            .collect();
        answers.insert(item.question.clone(), labels.join(MULTI_SELECT_SEPARATOR));
    }
    Ok(answers)
}

fn prompt_item(item: &QuestionItem) -> Result<Vec<usize>> {
    let theme = ColorfulTheme::default();
    let labels: Vec<String> = item
        .options
        .iter()
        .map(|o| match &o.description {
            Some(d) => format!("{} - {}", o.label, d),
            None => o.label.clone(),
        })
        .collect();
    let prompt = match &item.header {
        Some(header) => format!("[{}] {}", header, item.question),
        None => item.question.clone(),
    };

    if item.multi_select {
        Ok(MultiSelect::with_theme(&theme)
            .with_prompt(prompt)
            .items(&labels)
            .interact()?)
    } else {
        let selection = Select::with_theme(&theme)
            .with_prompt(prompt)
            .items(&labels)
            .default(0)
            .interact()?;
        Ok(vec![selection])
    }
}

/// Answers questions interactively as they are published.
///
/// Prompts run on a detached thread so an open prompt never holds the runtime
/// open. If the terminal cannot produce an answer (closed stdin, Ctrl-C inside
/// a prompt) the run is asked to shut down.
pub struct ConsoleResponder {
    broker: Arc<QuestionBroker>,
    multi: Option<MultiProgress>,
    shutdown: ShutdownFlag,
}

impl ConsoleResponder {
    pub fn new(broker: Arc<QuestionBroker>, multi: Option<MultiProgress>, shutdown: ShutdownFlag) -> Self {
        Self {
            broker,
            multi,
            shutdown,
        }
    }

    pub fn spawn(self, rx: broadcast::Receiver<LifecycleEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    async fn run(self, mut rx: broadcast::Receiver<LifecycleEvent>) {
        loop {
            let question = match rx.recv().await {
                Ok(LifecycleEvent::QuestionPending { question }) => question,
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    warn!(component = "ui", missed, "responder missed events");
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            if !self.broker.is_waiting(&question.id) {
                debug!(component = "ui", id = %question.id, "question already settled");
                continue;
            }

            let multi = self.multi.clone();
            let asked = question.clone();
            let (tx, reply) = oneshot::channel();
            std::thread::spawn(move || {
                let ask = || collect_answers(&asked, prompt_item);
                let answers = match multi {
                    Some(multi) => multi.suspend(ask),
                    None => ask(),
                };
                let _ = tx.send(answers);
            });

            match reply.await {
                Ok(Ok(answers)) => {
                    if !self.broker.answer(&question.id, answers) {
                        debug!(component = "ui", id = %question.id, "answer arrived after another consumer answered");
                    }
                }
                Ok(Err(e)) => {
                    warn!(component = "ui", error = %e, "could not read an answer from the terminal, stopping");
                    self.shutdown.request();
                    return;
                }
                Err(_) => {
                    warn!(component = "ui", "prompt thread ended without an answer, stopping");
                    self.shutdown.request();
                    return;
                }
            }
        }
    }
}
