pub mod contract {
    pub const INVALID_ARGUMENT: &str = "DX100";
    pub const ILLEGAL_STATE: &str = "DX200";
}
