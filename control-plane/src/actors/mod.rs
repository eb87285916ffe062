pub mod scan_loop;

pub use scan_loop::{ScanLoopActor, ScanLoopArguments, ScanLoopMsg, ScanStats};
