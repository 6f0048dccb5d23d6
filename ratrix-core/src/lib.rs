//! Unattended multi-camera recording.
//!
//! A [`supervisor::Supervisor`] keeps one camera worker process per configured camera
//! alive. Each worker ([`worker::CameraWorker`]) captures frames, writes them into
//! fixed-length segments and hands every finished segment to a transfer
//! ([`transfer::Transferer`]) that moves it from temporary to permanent storage.

pub mod annotate;
pub mod capture;
pub mod encoder;
pub mod preview;
pub mod process;
pub mod recovery;
pub mod segment;
pub mod settings;
pub mod sleep_guard;
pub mod stop;
pub mod supervisor;
pub mod transfer;
pub mod worker;
