pub mod entry_pool;
pub mod fixed_buffer;
pub mod packet_pool;
