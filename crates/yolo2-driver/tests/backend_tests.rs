//! Backend integration tests
//!
//! Software tests run everywhere; FPGA tests need the bitstream loaded,
//! root, and a u-dma-buf carve-out.

use std::time::Duration;
use yolo2_chip::geometry::{conv_geometry, pool_geometry, reorg_geometry};
use yolo2_chip::limits::{align8, footprint};
use yolo2_chip::{BufferAddrs, ControlJob, Fixed16, Float32, QValues};
use yolo2_driver::dispatch::BufferRange;
use yolo2_driver::{
    select_backend, BackendSelection, BackendType, DispatchConfig, HandshakeConfig, JobDispatcher, ParamBlob,
};

fn software<P: yolo2_chip::Precision>() -> JobDispatcher {
    let platform = select_backend::<P>(BackendSelection::Software, &HandshakeConfig::default())
        .expect("software backend");
    JobDispatcher::new(platform, DispatchConfig::default())
}

#[test]
fn conv_pool_reorg_chain_on_software_backend() {
    // conv 1→4 (3x3, pad 1) on 4x4, then maxpool 2/2, then reorg: 16 x 1 x 1
    let mut d = software::<Float32>();
    let alloc = &mut d.platform_mut().allocator;

    let mut image = vec![0.0_f32; footprint(1, 4, 4)];
    for y in 0..4 {
        for x in 0..4 {
            image[y * align8(4) + x] = (y * 4 + x) as f32;
        }
    }
    // filter o passes the centre tap scaled by o+1
    let mut weights = vec![0.0_f32; 4 * 9];
    for o in 0..4 {
        // [i][j][tm][tn] with tn_min = 1: centre tap (1,1) block at 4·4
        weights[4 * 4 + o] = (o + 1) as f32;
    }

    let (input, _) = yolo2_driver::loading::upload(alloc.as_mut(), &ParamBlob::from_slice(&image)).unwrap();
    let (w, _) = yolo2_driver::loading::upload(alloc.as_mut(), &ParamBlob::from_slice(&weights)).unwrap();
    let (b, _) = yolo2_driver::loading::upload(alloc.as_mut(), &ParamBlob::from_slice(&[0.0_f32; 4])).unwrap();
    let conv_out = alloc.allocate(footprint(4, 4, 4) * 4).unwrap();
    let pool_out = alloc.allocate(footprint(4, 2, 2) * 4).unwrap();
    let reorg_out = alloc.allocate(footprint(16, 1, 1) * 4).unwrap();

    let conv = ControlJob::conv(
        conv_geometry(1, 4, 4, 4, 3, 1, 1).unwrap(),
        BufferAddrs {
            input: input.phys_addr(),
            output: conv_out.phys_addr(),
            weight: w.phys_addr(),
            bias: b.phys_addr(),
        },
        false,
        false,
        QValues::default(),
    );
    d.dispatch(
        &conv,
        &[BufferRange::whole(&input), BufferRange::whole(&w), BufferRange::whole(&b)],
        BufferRange::whole(&conv_out),
    )
    .unwrap();

    let pool = ControlJob::data_movement(
        pool_geometry(4, 4, 4, 2, 2).unwrap(),
        conv_out.phys_addr(),
        pool_out.phys_addr(),
    );
    d.dispatch(&pool, &[BufferRange::whole(&conv_out)], BufferRange::whole(&pool_out))
        .unwrap();

    let reorg = ControlJob::data_movement(
        reorg_geometry(4, 2, 2).unwrap(),
        pool_out.phys_addr(),
        reorg_out.phys_addr(),
    );
    let report = d
        .dispatch(&reorg, &[BufferRange::whole(&pool_out)], BufferRange::whole(&reorg_out))
        .unwrap();
    assert_eq!(report.stats.unwrap().stores, 1);

    // pooled channel o = (o+1)·{5, 7, 13, 15}; reorg spreads each into 4 channels
    let out = reorg_out.typed::<f32>().unwrap();
    let plane = align8(1);
    for o in 0..4 {
        let scale = (o + 1) as f32;
        let got: Vec<f32> = (0..4).map(|p| out[(4 * o + p) * plane]).collect();
        assert_eq!(got, vec![5.0 * scale, 7.0 * scale, 13.0 * scale, 15.0 * scale]);
    }
    assert_eq!(d.dispatched(), 3);
}

#[test]
fn fixed_and_float_backends_report_software() {
    assert_eq!(software::<Fixed16>().platform().backend.backend_type(), BackendType::Software);
    assert_eq!(software::<Float32>().platform().backend.backend_type(), BackendType::Software);
}

#[test]
#[ignore] // Requires hardware
fn fpga_backend_initializes() {
    let platform = select_backend::<Fixed16>(BackendSelection::Register, &HandshakeConfig::default())
        .expect("FPGA backend init");
    assert!(platform.backend.is_ready());
    println!("Backend: {}", platform.backend.backend_type());
    println!("Allocator: {}", platform.allocator.name());
}

#[test]
#[ignore] // Requires hardware
fn fpga_status_register_reads_idle() {
    let mut platform = select_backend::<Fixed16>(BackendSelection::Register, &HandshakeConfig::default())
        .expect("FPGA backend init");
    let status = platform.backend.status().unwrap();
    println!("AP_CTRL = {status}");
    assert!(status.is_idle());
}

#[test]
#[ignore] // Requires hardware
fn fpga_pool_completes_within_timeout() {
    let config = DispatchConfig::default();
    let platform = select_backend::<Fixed16>(BackendSelection::Register, &config.handshake).unwrap();
    let mut d = JobDispatcher::new(platform, config);
    let alloc = &mut d.platform_mut().allocator;
    let input = alloc.allocate(footprint(32, 416, 416) * 2).unwrap();
    let output = alloc.allocate(footprint(32, 208, 208) * 2).unwrap();

    let job = ControlJob::data_movement(
        pool_geometry(32, 416, 416, 2, 2).unwrap(),
        input.phys_addr(),
        output.phys_addr(),
    );
    let report = d
        .dispatch(&job, &[BufferRange::whole(&input)], BufferRange::whole(&output))
        .unwrap();
    assert!(report.duration < Duration::from_secs(1));
    println!("maxpool 416→208: {:?} ({} polls)", report.duration, report.polls);
}
