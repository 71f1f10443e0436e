pub mod descriptor_cache;
pub mod descriptor_pool;
pub mod dynamic_ubo_manager;
pub mod settings;
pub mod static_ubo;
pub mod storage_array;
pub mod ubo_arena;
