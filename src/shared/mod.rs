pub mod frame_parser;
pub mod interval;
pub mod stack_walker;
pub mod stopper;
pub mod types;
