//! Integrationstests beider Backends mit simulierten Geraeten

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fernsprech_audio::{
    AudioBackend, AudioError, BackendEvent, DeviceError, DtmfGenerator, HardwareBackend,
    OpenParams, RingBufferPool, ServerBackend, SimulatedPcmDriver, SimulatedServer, ToneState,
    VolumeControl, DEFAULT_ID,
};
use fernsprech_core::StreamDirection;

fn teile() -> (Arc<RingBufferPool>, Arc<VolumeControl>, Arc<ToneState>) {
    (
        Arc::new(RingBufferPool::default()),
        Arc::new(VolumeControl::default()),
        Arc::new(ToneState::new()),
    )
}

fn warte_bis(bedingung: impl Fn() -> bool) -> bool {
    let ende = Instant::now() + Duration::from_secs(2);
    while Instant::now() < ende {
        if bedingung() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn server_backend() -> (ServerBackend, SimulatedServer, Arc<RingBufferPool>) {
    let sim = SimulatedServer::new();
    let (pool, volume, toene) = teile();
    let b = ServerBackend::new(Box::new(sim.clone()), Arc::clone(&pool), volume, toene);
    (b, sim, pool)
}

// ---------------------------------------------------------------------------
// Hardware
// ---------------------------------------------------------------------------

#[test]
fn aufnahme_fehler_laesst_wiedergabe_laufen() {
    let treiber = SimulatedPcmDriver::new();
    treiber.fail_open(StreamDirection::Capture);
    let (pool, volume, toene) = teile();
    let mut b = HardwareBackend::new(Arc::new(treiber.clone()), pool, volume, toene);

    b.open_device(OpenParams::default()).unwrap();
    b.start_stream().unwrap();

    assert!(b.is_started());
    let fehler = b.device_error();
    assert_eq!(fehler.len(), 1);
    assert!(matches!(fehler[0], DeviceError::Capture(_)));
    assert!(warte_bis(|| treiber.written(StreamDirection::Playback).len() >= 320));

    b.stop_stream().unwrap();
    assert!(!b.is_started());
}

#[test]
fn dtmf_verdraengt_anrufaudio_ueber_hardware() {
    let treiber = SimulatedPcmDriver::new();
    let (pool, volume, toene) = teile();
    let mut b = HardwareBackend::new(Arc::new(treiber.clone()), Arc::clone(&pool), volume, toene);
    b.open_device(OpenParams::default()).unwrap();

    pool.create_ring_buffer("anruf-1");
    pool.bind_call(DEFAULT_ID, "anruf-1");
    b.start_stream().unwrap();

    DtmfGenerator::new(8000).send(&pool, '1').unwrap();
    assert!(warte_bis(|| pool.urgent_available(DEFAULT_ID) == 0));
    b.stop_stream().unwrap();

    let geschrieben = treiber.written(StreamDirection::Playback);
    let maximum = geschrieben.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
    assert!(maximum > 1000, "DTMF sollte hoerbar sein: {}", maximum);
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[test]
fn streams_werden_erst_nach_allen_bereitmeldungen_freigegeben() {
    let (mut b, sim, _pool) = server_backend();
    b.open_device(OpenParams::default()).unwrap();
    sim.set_automatic(false);

    let starter = thread::spawn(move || {
        let ergebnis = b.start_stream();
        (b, ergebnis)
    });

    assert!(warte_bis(|| sim.stream_count() == 2));
    // Nur die Bereitmeldung der Wiedergabe zustellen
    sim.step();
    sim.step();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(sim.is_corked(StreamDirection::Playback), Some(true));
    assert_eq!(sim.is_corked(StreamDirection::Capture), Some(true));

    sim.run_pending();
    let (mut b, ergebnis) = starter.join().unwrap();
    ergebnis.unwrap();
    assert_eq!(sim.is_corked(StreamDirection::Playback), Some(false));
    assert_eq!(sim.is_corked(StreamDirection::Capture), Some(false));

    sim.set_automatic(true);
    b.stop_stream().unwrap();
    assert_eq!(sim.stream_count(), 0);
}

#[test]
fn gescheiterter_aufnahme_stream_ist_kein_startfehler() {
    let (mut b, sim, _pool) = server_backend();
    sim.fail_stream(StreamDirection::Capture);
    b.open_device(OpenParams::default()).unwrap();
    b.start_stream().unwrap();

    assert!(b.is_started());
    assert!(matches!(b.device_error().as_slice(), [DeviceError::Capture(_)]));
    assert_eq!(sim.is_corked(StreamDirection::Playback), Some(false));
    assert_eq!(sim.is_corked(StreamDirection::Capture), None);
}

#[test]
fn ohne_bereite_streams_schlaegt_start_fehl() {
    let (mut b, sim, _pool) = server_backend();
    sim.reject_stream(StreamDirection::Playback);
    sim.fail_stream(StreamDirection::Capture);
    b.open_device(OpenParams::default()).unwrap();

    assert!(matches!(b.start_stream(), Err(AudioError::KeinGeraet(_))));
    assert_eq!(b.device_error().len(), 2);
    assert_eq!(sim.stream_count(), 0);
}

#[test]
fn dtmf_vor_anrufaudio_und_gleich_viel_verworfen() {
    let (mut b, sim, pool) = server_backend();
    b.open_device(OpenParams::default()).unwrap();
    pool.create_ring_buffer("anruf-1");
    pool.bind_call(DEFAULT_ID, "anruf-1");
    b.start_stream().unwrap();

    pool.put_data("anruf-1", &[1000; 800]);
    let dtmf = DtmfGenerator::new(8000).generate('5').unwrap();
    pool.put_urgent(&dtmf);

    sim.pump(160);
    let aus = sim.written(StreamDirection::Playback);
    assert_eq!(aus.len(), 160);
    for (a, e) in aus.iter().zip(&dtmf) {
        assert!((*a as i32 - *e as i32).abs() <= 1);
    }
    assert_eq!(pool.available_for_get(DEFAULT_ID), 800 - 160);
}

#[test]
fn anrufaudio_wird_auf_geraeterate_gewandelt() {
    let (mut b, sim, pool) = server_backend();
    sim.set_stream_rate(16000);
    b.open_device(OpenParams::default()).unwrap();
    pool.create_ring_buffer("anruf-1");
    pool.bind_call(DEFAULT_ID, "anruf-1");
    b.start_stream().unwrap();

    pool.put_data("anruf-1", &[500; 400]);
    sim.pump(320);
    assert_eq!(sim.written(StreamDirection::Playback).len(), 320);
    assert_eq!(pool.available_for_get(DEFAULT_ID), 400 - 160);
}

#[test]
fn mikrofon_landet_im_standardpuffer() {
    let (mut b, sim, pool) = server_backend();
    b.open_device(OpenParams::default()).unwrap();
    b.start_stream().unwrap();
    pool.register_reader("anruf-1", fernsprech_audio::ReaderKind::Normal)
        .unwrap();
    pool.bind_call("anruf-1", DEFAULT_ID);

    sim.feed_capture(&[2000; 160]);
    assert_eq!(pool.available_for_get("anruf-1"), 160);
}

#[test]
fn abbau_wartet_und_meldet_stopp() {
    let (mut b, sim, pool) = server_backend();
    let rx = b.events();
    b.open_device(OpenParams::default()).unwrap();
    b.start_stream().unwrap();
    b.stop_stream().unwrap();

    assert_eq!(sim.stream_count(), 0);
    assert!(!pool.has_urgent_reader(DEFAULT_ID));
    let events: Vec<BackendEvent> = rx.try_iter().collect();
    assert_eq!(events, vec![BackendEvent::Started, BackendEvent::Stopped]);

    // Neustart nach sauberem Abbau
    b.start_stream().unwrap();
    assert!(b.is_started());
}
