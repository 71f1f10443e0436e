use slotmap::new_key_type;

// GPU 资源的轻量级句柄，真正的资源存放在 backend 的 SlotMap 中

new_key_type! { pub struct GfxBufferHandle; }
new_key_type! { pub struct GfxDescriptorSetLayoutHandle; }
new_key_type! { pub struct GfxDescriptorPoolHandle; }
new_key_type! { pub struct GfxDescriptorSetHandle; }
