//! Console implementations of the core's prompt interfaces.

use std::io::Write;
use std::path::PathBuf;

use lanferry_core::ui::{ConflictChoice, FilePicker, UserPrompts};

/// Interactive prompts on stdin/stdout.
///
/// Calls block the current thread while waiting for input; the
/// multi-threaded runtime keeps transfers moving meanwhile.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsolePrompts;

fn ask(question: &str) -> String {
    print!("{question} ");
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return String::new();
    }
    line.trim().to_lowercase()
}

impl UserPrompts for ConsolePrompts {
    fn confirm_transfer(&self, file_name: &str, size: u64) -> bool {
        let answer = ask(&format!("Accept '{file_name}' ({size} bytes)? [y/N]"));
        matches!(answer.as_str(), "y" | "yes")
    }

    fn resolve_conflict(&self, file_name: &str) -> ConflictChoice {
        loop {
            let answer = ask(&format!(
                "'{file_name}' already exists: [o]verwrite, [r]ename, [a]bort?"
            ));
            match answer.as_str() {
                "o" | "overwrite" => return ConflictChoice::Overwrite,
                "r" | "rename" => return ConflictChoice::Rename,
                "a" | "abort" | "" => return ConflictChoice::Abort,
                _ => println!("Please answer o, r, or a."),
            }
        }
    }

    fn report_error(&self, message: &str) {
        eprintln!("error: {message}");
    }
}

/// Picker fed from command line arguments, standing in for the
/// platform file dialogs a GUI shell would provide.
#[derive(Debug, Clone, Default)]
pub struct ArgsPicker {
    files: Vec<PathBuf>,
    dir: Option<PathBuf>,
}

impl ArgsPicker {
    /// Picker offering the given files for sending.
    pub fn for_send(files: Vec<PathBuf>) -> Self {
        Self { files, dir: None }
    }

    /// Picker offering the given folder for receiving.
    pub fn for_receive(dir: Option<PathBuf>) -> Self {
        Self {
            files: Vec::new(),
            dir,
        }
    }
}

impl FilePicker for ArgsPicker {
    fn pick_send_files(&self) -> Option<Vec<PathBuf>> {
        if self.files.is_empty() {
            None
        } else {
            Some(self.files.clone())
        }
    }

    fn pick_receive_dir(&self) -> Option<PathBuf> {
        self.dir.clone()
    }
}
