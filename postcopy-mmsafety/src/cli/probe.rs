use postcopy_mmsafety::uffd;

pub fn probe() {
    let support = uffd::probe();
    if support.is_supported() {
        println!("✓ {}: postcopy migration can run on this host", support);
    } else {
        println!("ℹ {}: postcopy migration would be skipped", support);
    }
}
