/// Why a captured frame failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameErrorKind {
    Crc,
    Truncated,
    Oversize,
    UnknownFunction,
}

impl std::fmt::Display for FrameErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crc => write!(f, "crc"),
            Self::Truncated => write!(f, "truncated"),
            Self::Oversize => write!(f, "oversize"),
            Self::UnknownFunction => write!(f, "unknown_function"),
        }
    }
}
