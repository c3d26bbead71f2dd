// caseroom-common: shared wire types and the case stream codec

pub mod protocol;
pub mod types;
