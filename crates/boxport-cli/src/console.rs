//! Terminal implementation of the pipeline's [`Ui`].

use std::cell::RefCell;
use std::time::Duration;

use boxport_core::Ui;
use indicatif::{ProgressBar, ProgressStyle};

/// Prints messages to the terminal and shows progress on a single spinner line.
#[derive(Default)]
pub struct ConsoleUi {
    bar: RefCell<Option<ProgressBar>>,
}

impl ConsoleUi {
    pub fn new() -> Self {
        Self::default()
    }

    fn spinner() -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    }
}

impl Ui for ConsoleUi {
    fn info(&self, message: &str) {
        match self.bar.borrow().as_ref() {
            Some(pb) => pb.println(message),
            None => println!("{}", message),
        }
    }

    fn error(&self, message: &str) {
        let styled = console::style(message).red().bold();
        match self.bar.borrow().as_ref() {
            Some(pb) => pb.println(styled.to_string()),
            None => eprintln!("{}", styled),
        }
    }

    fn progress(&self, message: &str) {
        self.bar
            .borrow_mut()
            .get_or_insert_with(Self::spinner)
            .set_message(message.to_string());
    }

    fn clear_line(&self) {
        if let Some(pb) = self.bar.borrow_mut().take() {
            pb.finish_and_clear();
        }
    }
}
