pub mod cap;
