//! End-to-end boot scenarios against the simulated target.

use std::borrow::Cow;
use std::io::{self, Cursor, Write};
use std::sync::{Arc, Mutex};

use proxyboot::boot::{
    BootPlan, BootRequest, BootStage, Compression, DeviceTree, ImageDecoder, Orchestrator,
};
use proxyboot::fdt::{self, Fdt, FdtBuilder};
use proxyboot::memory::KERNEL_ALIGN;
use proxyboot::sim::{SimLink, SimTarget};
use proxyboot::{Error, Proxy, Session, SessionConfig, SessionState, UartProxy};

const MIB: usize = 1024 * 1024;

fn board_dtb() -> Vec<u8> {
    let mut b = FdtBuilder::new();
    b.begin_node("");
    b.property_string("compatible", "apple,j274");
    b.property_u32("#address-cells", 2);
    b.property_u32("#size-cells", 2);
    b.begin_node("chosen");
    b.property_string("stdout-path", "serial0");
    b.end_node();
    b.end_node();
    b.finish().unwrap()
}

fn sim_session() -> Session<SimTarget> {
    Session::new(SimTarget::new(), SessionConfig::default()).unwrap()
}

#[test]
fn test_large_kernel_then_no_more_calls() {
    let mut session = sim_session();
    let kernel: Vec<u8> = (0..5 * MIB).map(|i| (i % 251) as u8).collect();
    let plan = BootPlan::new(kernel.clone(), board_dtb());

    let staged = Orchestrator::new(&mut session).boot(&plan).unwrap();
    let kernel_region = *staged.request.kernel_region();
    assert_eq!(kernel_region.address % KERNEL_ALIGN, 0);
    assert_eq!(kernel_region.size, 5 * MIB as u64);
    assert_eq!(session.state(), SessionState::HandedOff);

    assert!(matches!(session.allocator(), Err(Error::SessionHandedOff)));
    assert!(matches!(session.transfer(), Err(Error::SessionHandedOff)));
    assert!(matches!(session.boot_args(), Err(Error::SessionHandedOff)));
    assert!(matches!(
        Orchestrator::new(&mut session).load(&plan),
        Err(Error::SessionHandedOff)
    ));

    let mut target = session.into_inner();
    assert_eq!(target.booted(), Some(kernel_region.address));
    assert_eq!(
        target.peek(kernel_region.address, kernel.len()).unwrap(),
        kernel
    );
    // The stub itself is gone too.
    assert!(matches!(target.malloc(16), Err(Error::Io(_))));
}

#[test]
fn test_bootargs_in_retrieved_tree() {
    let dir = tempfile::tempdir().unwrap();
    let saved = dir.path().join("patched.dtb");

    let mut session = sim_session();
    let plan = BootPlan::new(vec![0xaa; 0x4000], board_dtb())
        .initramfs(vec![0x55; 0x3000])
        .bootargs("console=ttyS0")
        .retrieve_to(&saved);

    let staged = Orchestrator::new(&mut session).load(&plan).unwrap();
    let blob = std::fs::read(&saved).unwrap();
    assert_eq!(blob, staged.patched_dtb);
    assert_eq!(fdt::total_size(&blob).unwrap() as usize, blob.len());

    let tree = Fdt::parse(&blob).unwrap();
    let chosen = tree.node("/chosen").unwrap();
    assert_eq!(chosen.property_str("bootargs"), Some("console=ttyS0"));
    assert_eq!(chosen.property_str("stdout-path"), Some("serial0"));

    let initramfs = staged.initramfs.unwrap();
    assert_eq!(
        chosen.property_u64("linux,initrd-start"),
        Some(initramfs.address)
    );
    assert!(tree
        .reservations
        .contains(&(initramfs.address, initramfs.size)));
    assert!(tree.node("/memory").is_some());
}

struct Corrupt;

impl ImageDecoder for Corrupt {
    fn decoded_size(&self, _image: &[u8], _compression: Compression) -> i64 {
        -22
    }

    fn decode<'a>(&self, _image: &'a [u8], _compression: Compression) -> proxyboot::Result<Cow<'a, [u8]>> {
        panic!("decode must not run when the size is invalid");
    }
}

#[test]
fn test_negative_kernel_size_has_no_side_effects() {
    let mut session = sim_session();
    let plan = BootPlan::new(vec![0x1f, 0x8b, 0x08, 0x00], board_dtb())
        .initramfs(vec![0; 0x1000])
        .bootargs("quiet")
        .compression(Compression::Gz);

    let mut orchestrator = Orchestrator::new(&mut session).with_decoder(Corrupt);
    let err = orchestrator.load(&plan).unwrap_err();
    assert!(matches!(err, Error::InvalidTransferSize(-22)));
    assert_eq!(orchestrator.failed_at(), Some(BootStage::Validating));
    drop(orchestrator);

    let target = session.into_inner();
    assert_eq!(target.memory_writes(), 0);
    assert_eq!(target.live_allocations(), 0);
    assert_eq!(target.chosen("bootargs"), None);
}

#[test]
fn test_retrieve_before_prepare_rejected() {
    let mut session = sim_session();
    let dtb = board_dtb();
    let region = session
        .allocator()
        .unwrap()
        .allocate_top_of_memory(dtb.len() as u64)
        .unwrap();
    session.transfer().unwrap().write(region.address, &dtb).unwrap();

    let mut devtree = DeviceTree::new(region);
    assert!(matches!(
        devtree.retrieve(&mut session),
        Err(Error::InvalidState { .. })
    ));

    let kernel = session
        .allocator()
        .unwrap()
        .allocate_aligned(KERNEL_ALIGN, 0x1000)
        .unwrap();
    assert!(BootRequest::new(kernel, &devtree).is_err());
}

#[test]
fn test_prepare_failure_is_reported() {
    let mut session = sim_session();
    session.proxy().unwrap().fail_next_prepare(-1);
    let plan = BootPlan::new(vec![0; 0x100], board_dtb());

    let err = Orchestrator::new(&mut session).load(&plan).unwrap_err();
    assert!(matches!(err, Error::DeviceTreePrepare(-1)));
    // No rollback: the DTB stays allocated and the kernel was never sent.
    assert_eq!(session.regions().len(), 1);
    assert_eq!(session.into_inner().memory_writes(), 1);
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_boot_over_uart() {
    let mut target = SimTarget::new();
    target.set_console_output(b"[    0.000000] Booting Linux\n".to_vec());
    let link = SimLink::new(target);

    let proxy = UartProxy::connect(link.clone()).unwrap();
    let mut session = Session::new(proxy, SessionConfig::default()).unwrap();
    assert_eq!(session.boot_args().unwrap().revision, 1);

    let plan = BootPlan::new(vec![0x11; 0x2_0000], board_dtb())
        .initramfs(vec![0x22; 0x8000])
        .bootargs("earlycon");
    let staged = Orchestrator::new(&mut session).boot(&plan).unwrap();

    {
        let target = link.target();
        assert_eq!(target.booted(), Some(staged.request.entry()));
        assert_eq!(target.chosen("bootargs").as_deref(), Some("earlycon"));
        assert_eq!(
            target.initrd(),
            staged.initramfs.map(|r| (r.address, r.size))
        );
    }

    let mut proxy = session.into_inner();
    let (requests, written, read) = proxy.stats();
    assert!(requests > 0);
    assert!(written >= 0x2_8000);
    assert_eq!(read as usize, 8 + staged.patched_dtb.len() + proxyboot::bootargs::BOOT_ARGS_SIZE);

    let out = Captured::default();
    proxy
        .passthrough_with(Cursor::new(b"root\n".to_vec()), out.clone())
        .unwrap();
    assert_eq!(&*out.0.lock().unwrap(), b"[    0.000000] Booting Linux\n");
    assert_eq!(link.target().console_input(), b"root\n");
}

#[test]
fn test_line_noise_on_bulk_write() {
    let mut link = SimLink::new(SimTarget::new());
    let mut proxy = UartProxy::connect(link.clone()).unwrap();
    let addr = proxy.malloc(64).unwrap();

    link.corrupt_next_bulk_write();
    let err = proxy.write_memory(addr, &[0x42; 64]).unwrap_err();
    assert!(matches!(err, Error::Checksum { .. }));
    assert!(err.is_transport());
}
