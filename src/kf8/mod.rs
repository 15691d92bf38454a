//! KF8 (Mobi 8) reconstruction: part assembly from skeleton/fragment
//! tables and `kindle:` link rewriting.

pub mod rewrite;
pub mod skeleton;

pub use rewrite::rebuild_xhtml;
pub use skeleton::K8Processor;
