use gpucache_core::common::VAddr;
use gpucache_core::device::BufferHandle;
use gpucache_core::traits::{PageWatcher, TextureCache};
use mockall::mock;

mock! {
    pub Watcher {}
    impl PageWatcher for Watcher {
        fn update_write_watch(&self, addr: VAddr, size: u64, watch: bool);
        fn update_read_watch(&self, addr: VAddr, size: u64, watch: bool);
    }
}

mock! {
    pub Images {}
    impl TextureCache for Images {
        fn copy_to_buffer(&self, addr: VAddr, size: u64, dst: BufferHandle, dst_offset: u64) -> bool;
    }
}
