use std::env;

fn main() {
    let kernel_path = env!("KERNEL_PATH");

    println!("kernel image: {kernel_path:?}");

    let mut cmd = std::process::Command::new("qemu-system-riscv64");
    cmd.arg("-machine").arg("virt");
    cmd.arg("-m").arg("128M");
    cmd.arg("-nographic");
    cmd.arg("-bios").arg("none");
    cmd.arg("-kernel").arg(kernel_path);
    cmd.arg("-drive")
        .arg("file=disk.img,if=none,format=raw,id=x0");
    cmd.arg("-device")
        .arg("virtio-blk-device,drive=x0");

    if let Some(x) = env::args().nth(1) {
        if x == "DEBUG" {
            cmd.arg("-s").arg("-S");
        }
    }

    let mut child = cmd.spawn().unwrap();
    child.wait().unwrap();
}
