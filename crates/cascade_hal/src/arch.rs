cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub(crate) mod x86_64;
        pub(crate) use x86_64 as imp;
    } else if #[cfg(target_arch = "riscv64")] {
        pub(crate) mod riscv64;
        pub(crate) use riscv64 as imp;
    } else if #[cfg(target_arch = "aarch64")] {
        pub(crate) mod aarch64;
        pub(crate) use aarch64 as imp;
    } else {
        compile_error!("unsupported target architecture");
    }
}
