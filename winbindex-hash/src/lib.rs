mod hash_types;
pub use self::hash_types::*;
