/// Which I/O operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOperation {
    Read,
    Write,
    Flush,
    Connect,
    Listen,
    Configure,
}

impl std::fmt::Display for IoOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Flush => write!(f, "flush"),
            Self::Connect => write!(f, "connect"),
            Self::Listen => write!(f, "listen"),
            Self::Configure => write!(f, "configure"),
        }
    }
}
