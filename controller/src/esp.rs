use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{mpsc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    gpio::{AnyOutputPin, Gpio34, Output, OutputPin, PinDriver},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    ipv4::{Configuration as IpConfiguration, Mask, RouterConfiguration, Subnet},
    log::EspLogger,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;

use irrigation_common::{
    body_len_within, wrapping_clock_ms, ConfigBackend, ConfigPatch, ConfigStore, ControlCommand, ControlFacade,
    ControlReply, ControlRequest, ControlResponse, ControllerConfig, HardwareError,
    IrrigationSystem, MoistureSensor, NetworkConfig, Relay, StorageError,
};

const NVS_NAMESPACE: &str = "irrigation";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_BUFFER_BYTES: usize = 512;
const MAX_HTTP_BODY: usize = 4096;
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const RELAY_ACTIVE_LOW: bool = false;

const INDEX_HTML: &str = include_str!("../web/index.html");

type Envelope = (ControlRequest, mpsc::Sender<ControlReply>);
type DeviceSystem = IrrigationSystem<NvsBackend, SoilProbe, GpioRelay>;
type HttpRequest<'a, 'b> = Request<&'a mut EspHttpConnection<'b>>;

/// Config record in a single NVS string key. When the partition could not be
/// opened every access fails and the store runs from memory.
struct NvsBackend {
    nvs: Option<EspNvs<NvsDefault>>,
}

impl NvsBackend {
    fn open(partition: EspDefaultNvsPartition) -> Self {
        match EspNvs::new(partition, NVS_NAMESPACE, true) {
            Ok(nvs) => Self { nvs: Some(nvs) },
            Err(err) => {
                warn!("failed to open NVS namespace `{NVS_NAMESPACE}`: {err:?}");
                Self { nvs: None }
            }
        }
    }

    fn nvs(&mut self) -> Result<&mut EspNvs<NvsDefault>, StorageError> {
        self.nvs
            .as_mut()
            .ok_or_else(|| StorageError::Unavailable("NVS not mounted".to_string()))
    }
}

impl ConfigBackend for NvsBackend {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        let nvs = self.nvs()?;
        let mut buffer = vec![0_u8; NVS_BUFFER_BYTES];
        let value = nvs
            .get_str(NVS_CONFIG_KEY, &mut buffer)
            .map_err(|err| StorageError::Unavailable(format!("NVS read failed: {err:?}")))?;
        Ok(value.map(|text| text.as_bytes().to_vec()))
    }

    fn write(&mut self, payload: &[u8]) -> Result<(), StorageError> {
        let text = core::str::from_utf8(payload)
            .map_err(|err| StorageError::Unavailable(format!("config is not utf-8: {err}")))?;
        self.nvs()?
            .set_str(NVS_CONFIG_KEY, text)
            .map_err(|err| StorageError::Unavailable(format!("NVS write failed: {err:?}")))
    }
}

/// Resistive probe on ADC1. The probe is only powered while sampling to slow
/// electrode corrosion.
struct SoilProbe {
    channel: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>,
    power: PinDriver<'static, AnyOutputPin, Output>,
    settle: Duration,
}

impl MoistureSensor for SoilProbe {
    fn read_raw(&mut self) -> Result<i32, HardwareError> {
        self.power
            .set_high()
            .map_err(|err| HardwareError::new(format!("probe power on failed: {err:?}")))?;
        thread::sleep(self.settle);
        let sample = self.channel.read_raw();
        if let Err(err) = self.power.set_low() {
            warn!("probe power off failed: {err:?}");
        }

        sample
            .map(i32::from)
            .map_err(|err| HardwareError::new(format!("adc read failed: {err:?}")))
    }
}

struct GpioRelay {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl GpioRelay {
    fn new(mut pin: PinDriver<'static, AnyOutputPin, Output>) -> anyhow::Result<Self> {
        write_relay_level(&mut pin, false)?;
        Ok(Self { pin })
    }
}

impl Relay for GpioRelay {
    fn set(&mut self, energized: bool) -> Result<(), HardwareError> {
        write_relay_level(&mut self.pin, energized)
            .map_err(|err| HardwareError::new(format!("valve relay write failed: {err:#}")))?;
        info!("valve relay {}", if energized { "on" } else { "off" });
        Ok(())
    }
}

fn write_relay_level(
    pin: &mut PinDriver<'static, AnyOutputPin, Output>,
    energized: bool,
) -> anyhow::Result<()> {
    if energized != RELAY_ACTIVE_LOW {
        pin.set_high()?;
    } else {
        pin.set_low()?;
    }
    Ok(())
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    // Relay first so the valve is closed before anything else can fail.
    let relay = GpioRelay::new(PinDriver::output(pins.gpio26.downgrade_output())?)
        .context("failed to initialize valve relay")?;

    let mut timing = ControllerConfig::default();
    timing.sanitize();

    let adc = AdcDriver::new(peripherals.adc1)?;
    let adc_config = AdcChannelConfig {
        attenuation: DB_11,
        ..Default::default()
    };
    let mut probe_power = PinDriver::output(pins.gpio25.downgrade_output())?;
    probe_power.set_low()?;
    let probe = SoilProbe {
        channel: AdcChannelDriver::new(adc, pins.gpio34, &adc_config)
            .context("failed to configure moisture ADC channel")?,
        power: probe_power,
        settle: Duration::from_millis(timing.probe_settle_ms.into()),
    };

    let store = ConfigStore::load(NvsBackend::open(nvs_partition.clone()));
    let config = store.config();
    info!(
        "config loaded: dry={} wet={} threshold={}% (storage healthy: {})",
        config.dry_reading,
        config.wet_reading,
        config.dry_threshold_percent,
        store.storage_healthy()
    );

    let network = network_config();
    let wifi = start_access_point(peripherals.modem, sys_loop, nvs_partition, &network)
        .context("wifi access point startup failed")?;

    let system = IrrigationSystem::new(store, probe, relay, &timing);
    let (control, requests) = mpsc::channel();
    spawn_control_loop(system, requests, timing.loop_idle_ms)?;

    let server = create_http_server(control, network.portal_url())?;
    info!(
        "dashboard at http://{} on `{}`",
        ipv4_from_octets(network.ap_address),
        network.ap_ssid
    );

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn network_config() -> NetworkConfig {
    let mut network = NetworkConfig::default();
    if let Some(ssid) = option_env!("AP_SSID") {
        network.ap_ssid = ssid.to_string();
    }
    if let Some(pass) = option_env!("AP_PASS") {
        network.ap_password = pass.to_string();
    }
    network.sanitize();
    network
}

fn start_access_point(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    esp_wifi
        .swap_netif_ap(build_ap_netif(network)?)
        .context("failed to apply access point address")?;

    {
        let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;
        wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
            ssid: network
                .ap_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("access point SSID too long"))?,
            password: network
                .ap_password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("access point password too long"))?,
            auth_method: AuthMethod::WPA2Personal,
            channel: 1,
            ..Default::default()
        }))?;
        wifi.start()?;
        wifi.wait_netif_up()?;
    }

    info!("access point `{}` started", network.ap_ssid);
    Ok(esp_wifi)
}

fn build_ap_netif(network: &NetworkConfig) -> anyhow::Result<EspNetif> {
    let gateway = ipv4_from_octets(network.ap_address);
    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Router(RouterConfiguration {
            subnet: Subnet {
                gateway,
                mask: Mask(24),
            },
            dhcp_enabled: true,
            dns: Some(gateway),
            secondary_dns: None,
        })),
        ..NetifConfiguration::wifi_default_router()
    };

    let mut netif = EspNetif::new_with_conf(&conf)?;
    netif
        .set_hostname(&network.hostname)
        .context("failed to set access point hostname")?;
    Ok(netif)
}

fn ipv4_from_octets(ip: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])
}

fn spawn_control_loop(
    mut system: DeviceSystem,
    requests: mpsc::Receiver<Envelope>,
    idle_ms: u32,
) -> anyhow::Result<()> {
    let idle = Duration::from_millis(idle_ms.into());

    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            let mut detached = false;
            loop {
                match requests.recv_timeout(idle) {
                    Ok((request, reply)) => {
                        let outcome = system.handle(request, monotonic_ms());
                        if reply.send(outcome).is_err() {
                            debug!("http handler went away before the reply");
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        if !detached {
                            warn!("request channel closed; control loop continues without http");
                            detached = true;
                        }
                        thread::sleep(idle);
                    }
                }

                system.service(monotonic_ms());
            }
        })
        .context("failed to spawn control loop thread")?;

    Ok(())
}

fn create_http_server(
    control: mpsc::Sender<Envelope>,
    portal_url: String,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
            .write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let control = control.clone();
        server.fn_handler("/api/sensors", Method::Get, move |req| {
            forward(req, &control, ControlRequest::Sensors)
        })?;
    }

    {
        let control = control.clone();
        server.fn_handler("/api/config", Method::Get, move |req| {
            forward(req, &control, ControlRequest::Config)
        })?;
    }

    for method in [Method::Put, Method::Post] {
        let control = control.clone();
        server.fn_handler("/api/config", method, move |mut req| {
            let body = match read_request_body(&mut req) {
                Ok(body) => body,
                Err(err) => return write_error(req, 400, &format!("{err:#}")),
            };
            match ConfigPatch::from_json(&body) {
                Ok(patch) => forward(req, &control, ControlRequest::UpdateConfig(patch)),
                Err(reason) => respond(req, Err(reason.into())),
            }
        })?;
    }

    server.fn_handler("/api/control", Method::Post, move |mut req| {
        let body = match read_request_body(&mut req) {
            Ok(body) => body,
            Err(err) => return write_error(req, 400, &format!("{err:#}")),
        };
        match ControlCommand::from_json(&body) {
            Ok(command) => forward(req, &control, ControlRequest::Control(command)),
            Err(reason) => respond(req, Err(reason.into())),
        }
    })?;

    // Registered last so the routes above match first. Phones probing for a
    // captive portal land on the dashboard.
    server.fn_handler::<anyhow::Error, _>("/*", Method::Get, move |req| {
        debug!("redirecting {} to the dashboard", req.uri());
        req.into_response(302, Some("Found"), &[("Location", portal_url.as_str())])?;
        Ok(())
    })?;

    Ok(server)
}

/// Hands the request to the control loop and blocks until it answers.
fn forward(
    req: HttpRequest<'_, '_>,
    control: &mpsc::Sender<Envelope>,
    request: ControlRequest,
) -> anyhow::Result<()> {
    let (reply_tx, reply_rx) = mpsc::channel();
    if control.send((request, reply_tx)).is_err() {
        return write_error(req, 503, "control loop is not running");
    }

    match reply_rx.recv_timeout(REPLY_TIMEOUT) {
        Ok(reply) => respond(req, reply),
        Err(_) => write_error(req, 503, "control loop did not answer"),
    }
}

fn respond(req: HttpRequest<'_, '_>, reply: ControlReply) -> anyhow::Result<()> {
    match reply {
        Ok(ControlResponse::Sensors(snapshot)) => write_json(req, 200, &snapshot),
        Ok(ControlResponse::Config(config)) => write_json(req, 200, &config),
        Err(err) => {
            if err.http_status() >= 500 {
                warn!("request failed: {err}");
            }
            write_json(req, err.http_status(), &err.body())
        }
    }
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = body_len_within(req.content_len(), MAX_HTTP_BODY)?;

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: HttpRequest<'_, '_>,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    write_json(req, status_code, &payload)
}

fn monotonic_ms() -> u32 {
    static START: OnceLock<Instant> = OnceLock::new();
    let elapsed = START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX);
    wrapping_clock_ms(elapsed)
}
