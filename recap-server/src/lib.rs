pub mod subsystems;
