pub mod medical;

pub use medical::{MedicalReranker, RerankFactors};
