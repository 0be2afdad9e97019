pub mod check;
#[cfg(unix)]
pub mod demo_worker;
pub mod run;
