// Operation errors carry the wire codes handed back to RPC callers. Code 0 is
// success and never appears here.

pub const SUCCESS: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MbdError {
    #[error("Invalid VE name")]
    InvalidVeName,
    #[error("Invalid VE type")]
    InvalidVeType,
    #[error("Invalid VE configuration")]
    InvalidVeConfig,
    #[error("VE name already in use")]
    VeNameAlreadyInUse,
    #[error("VE not registered")]
    VeNotRegistered,
    #[error("VE already active")]
    VeAlreadyActive,
    #[error("VE operation failed")]
    VeOperationFailed,
    #[error("No space for VE")]
    NoSpace,
    #[error("VE not active")]
    VeNotActive,
}

impl MbdError {
    pub fn code(self) -> u32 {
        match self {
            MbdError::InvalidVeName => 1,
            MbdError::InvalidVeType => 2,
            MbdError::InvalidVeConfig => 3,
            MbdError::VeNameAlreadyInUse => 4,
            MbdError::VeNotRegistered => 5,
            MbdError::VeAlreadyActive => 6,
            MbdError::VeOperationFailed => 7,
            MbdError::NoSpace => 8,
            MbdError::VeNotActive => 9,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => MbdError::InvalidVeName,
            2 => MbdError::InvalidVeType,
            3 => MbdError::InvalidVeConfig,
            4 => MbdError::VeNameAlreadyInUse,
            5 => MbdError::VeNotRegistered,
            6 => MbdError::VeAlreadyActive,
            7 => MbdError::VeOperationFailed,
            8 => MbdError::NoSpace,
            9 => MbdError::VeNotActive,
            _ => return None,
        })
    }
}

pub fn strerror(code: u32) -> String {
    if code == SUCCESS {
        return "Success".to_string();
    }
    match MbdError::from_code(code) {
        Some(e) => e.to_string(),
        None => "Unknown error".to_string(),
    }
}
