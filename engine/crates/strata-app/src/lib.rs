pub mod frame_ubos;
pub mod scene_buffers;
pub mod scene_records;
