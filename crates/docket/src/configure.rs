use std::thread::ThreadId;

/// Which thread may drive a [crate::History]. Only checked in debug builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadCheck {
    #[default]
    Off,
    Only(ThreadId),
}

impl ThreadCheck {
    pub fn current() -> Self {
        ThreadCheck::Only(std::thread::current().id())
    }

    pub fn allowed_thread(&self) -> Option<ThreadId> {
        match self {
            ThreadCheck::Off => None,
            ThreadCheck::Only(id) => Some(*id),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    /// Oldest entries are dropped once the log grows past this many steps.
    /// `None` keeps everything.
    pub max_undo_steps: Option<usize>,
    pub thread_check: ThreadCheck,
}

impl HistoryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_undo_steps(mut self, steps: usize) -> Self {
        self.max_undo_steps = Some(steps);
        self
    }

    pub fn with_thread_check(mut self, check: ThreadCheck) -> Self {
        self.thread_check = check;
        self
    }
}
