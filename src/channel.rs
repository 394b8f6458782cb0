use std::{cell::RefCell, rc::Rc};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::generator::GeneratorError;

/// Error-notification channel of an environment or a generator.
///
/// Clones share the same listener. A run context subscribes from the stage that resolves the
/// channel's owner until the run ends. Errors emitted with nobody subscribed are logged and
/// dropped.
#[derive(Debug, Clone, Default)]
pub struct ErrorChannel {
    listener: Rc<RefCell<Option<UnboundedSender<GeneratorError>>>>,
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `error` to the current listener. Returns `false` when nobody listens.
    pub fn emit(&self, error: GeneratorError) -> bool {
        match self.listener.borrow().as_ref() {
            Some(sender) => match sender.send(error) {
                Ok(()) => true,
                Err(unsent) => {
                    log::warn!("error emitted after the listener went away: {}", unsent.0);
                    false
                }
            },
            None => {
                log::warn!("error emitted with no listener attached: {}", error);
                false
            }
        }
    }

    /// Replaces the current listener with a fresh one.
    pub fn subscribe(&self) -> UnboundedReceiver<GeneratorError> {
        let (sender, receiver) = mpsc::unbounded_channel();

        *self.listener.borrow_mut() = Some(sender);

        receiver
    }

    pub fn unsubscribe(&self) {
        self.listener.borrow_mut().take();
    }

    pub fn is_subscribed(&self) -> bool {
        self.listener.borrow().is_some()
    }
}
