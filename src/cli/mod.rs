pub mod doctor;

pub use doctor::doctor;
