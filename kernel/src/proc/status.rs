use core::fmt;

use super::ThreadError;

/// Lifecycle state of a thread.
///
/// `JustCreated -> Ready` on fork, `Ready -> Running` when switched in, `Running -> Ready` on
/// yield, `Running -> Blocked` on sleep or finish, `Blocked -> Ready` when something wakes it.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    JustCreated = 0,
    Running = 1,
    Ready = 2,
    Blocked = 3,
}

impl ThreadStatus {
    pub const fn label(self) -> &'static str {
        match self {
            ThreadStatus::JustCreated => "JUST_CREATED",
            ThreadStatus::Running => "RUNNING",
            ThreadStatus::Ready => "READY",
            ThreadStatus::Blocked => "BLOCKED",
        }
    }
}

impl TryFrom<u8> for ThreadStatus {
    type Error = ThreadError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(ThreadStatus::JustCreated),
            1 => Ok(ThreadStatus::Running),
            2 => Ok(ThreadStatus::Ready),
            3 => Ok(ThreadStatus::Blocked),
            _ => Err(ThreadError::UndefinedStatus(raw)),
        }
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
