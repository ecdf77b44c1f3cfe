pub mod crypto;
pub mod db;
pub mod model;

pub use db::Store;
pub use model::{
    ClaimOutcome, NewSecret, PeekOutcome, PutOutcome, Secret, SecretKind, SecretRecord,
};
