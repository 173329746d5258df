fn main() {
    println!("cargo:rerun-if-changed=src/hooks.c");

    cc::Build::new()
        .file("src/hooks.c")
        .compile("afl_driver_hooks");
}
