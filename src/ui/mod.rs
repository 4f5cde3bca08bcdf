pub mod icons;
pub mod progress;
pub mod prompt;

pub use progress::RunUI;
pub use prompt::ConsoleResponder;
