use core::convert::TryInto;
use std::{
    collections::HashMap,
    io::ErrorKind,
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyInputPin, AnyOutputPin, Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use outlet_common::{
    config::{NetworkConfig, RelayHardwareConfig},
    persist, Outlet, RuntimeConfig, Schedule,
};

use crate::{
    console::{self, Effect},
    device::Device,
};

const NVS_NAMESPACE: &str = "outlet";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_SCHEDULE_KEY: &str = "schedule";
const NVS_BUFFER_SIZE: usize = 4096;
const MAX_HTTP_BODY: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const BUTTON_DEBOUNCE_MS: u64 = 50;
const LOOP_PERIOD_MS: u64 = 50;
const CONSOLE_POLL_MS: u64 = 100;

const INDEX_HTML: &str = include_str!("../web/index.html");

type SharedDevice = Arc<Mutex<Device>>;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct CommandReply {
    reply: String,
}

/// Relay plus the indicator LED that mirrors it.
struct GpioRelay {
    relay: PinDriver<'static, AnyOutputPin, Output>,
    led: Option<PinDriver<'static, AnyOutputPin, Output>>,
    led_active_low: bool,
}

impl Outlet for GpioRelay {
    fn set_outlet(&mut self, on: bool) {
        let result = if on {
            self.relay.set_high()
        } else {
            self.relay.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive relay: {err}");
        }

        if let Some(led) = self.led.as_mut() {
            let drive_high = on != self.led_active_low;
            let result = if drive_high {
                led.set_high()
            } else {
                led.set_low()
            };
            if let Err(err) = result {
                warn!("failed to drive outlet LED: {err}");
            }
        }
    }

    fn is_outlet_on(&self) -> bool {
        self.relay.is_set_high()
    }
}

/// Active-low push button with a debounced press edge.
struct Button {
    pin: PinDriver<'static, AnyInputPin, Input>,
    pressed: bool,
    changed_at_ms: u64,
}

impl Button {
    /// Returns true once per press.
    fn poll(&mut self, now_ms: u64) -> bool {
        let down = self.pin.is_low();
        if down == self.pressed
            || now_ms.saturating_sub(self.changed_at_ms) < BUTTON_DEBOUNCE_MS
        {
            return false;
        }
        self.pressed = down;
        self.changed_at_ms = now_ms;
        down
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    info!(
        "NVS config loaded: ssid=`{}`, static_ip={}, relay=GPIO{}",
        runtime.network.wifi_ssid, runtime.network.use_static_ip, runtime.relay.relay_pin,
    );

    let schedule = nvs_store.load_schedule().unwrap_or_else(|err| {
        warn!("failed to load schedule from NVS: {err:#}");
        Schedule::default()
    });

    let Peripherals { modem, .. } = Peripherals::take()?;
    let relay = init_relay(&runtime.relay).context("relay initialization failed")?;
    let mut button = init_button(runtime.relay.button_pin);

    let boot_network = runtime.network.clone();
    let device: SharedDevice = Arc::new(Mutex::new(Device::new(
        runtime.clone(),
        schedule,
        Box::new(relay),
    )));

    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(Some(wifi)) => Some(wifi),
        Ok(None) => {
            warn!("no WiFi; running console-only until credentials are saved");
            None
        }
        Err(err) => {
            warn!("wifi startup failed, running console-only: {err:#}");
            None
        }
    };

    let (sntp, server) = if wifi.is_some() {
        let sntp = match EspSntp::new_default() {
            Ok(sntp) => {
                info!("SNTP initialized");
                Some(sntp)
            }
            Err(err) => {
                warn!("failed to start SNTP: {err}");
                None
            }
        };
        let server = create_http_server(device.clone(), nvs_store.clone())?;
        (sntp, Some(server))
    } else {
        (None, None)
    };

    spawn_console(device.clone(), nvs_store.clone(), boot_network)?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register control loop with watchdog: {err:#}");
    }

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();

        let synced = sntp
            .as_ref()
            .is_some_and(|sntp| sntp.get_sync_status() == SyncStatus::Completed);

        {
            let mut device = lock(&device);
            if synced && !device.is_time_synced() {
                info!("wall clock synchronized");
                device.set_time_synced(true);
            }

            if let Some(button) = button.as_mut() {
                if button.poll(now_ms) {
                    let on = device.toggle();
                    info!("button: outlet {}", if on { "on" } else { "off" });
                }
            }

            let now = device.now();
            device.tick(now);
        }

        thread::sleep(Duration::from_millis(LOOP_PERIOD_MS));
    }
}

fn lock(device: &SharedDevice) -> MutexGuard<'_, Device> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn init_relay(hardware: &RelayHardwareConfig) -> anyhow::Result<GpioRelay> {
    let mut relay = unsafe { PinDriver::output(AnyOutputPin::new(hardware.relay_pin)) }
        .with_context(|| format!("relay unavailable on GPIO{}", hardware.relay_pin))?;
    relay.set_low()?;

    let led = match unsafe { PinDriver::output(AnyOutputPin::new(hardware.led_pin)) } {
        Ok(pin) => Some(pin),
        Err(err) => {
            warn!("outlet LED unavailable on GPIO{}: {err}", hardware.led_pin);
            None
        }
    };

    let mut relay = GpioRelay {
        relay,
        led,
        led_active_low: hardware.led_active_low,
    };
    relay.set_outlet(false);
    info!(
        "relay on GPIO{}, LED on GPIO{}",
        hardware.relay_pin, hardware.led_pin
    );
    Ok(relay)
}

fn init_button(pin: i32) -> Option<Button> {
    let driver = unsafe { PinDriver::input(AnyInputPin::new(pin)) };
    match driver {
        Ok(mut driver) => {
            if let Err(err) = driver.set_pull(Pull::Up) {
                warn!("failed to enable button pull-up on GPIO{pin}: {err}");
            }
            Some(Button {
                pin: driver,
                pressed: false,
                changed_at_ms: 0,
            })
        }
        Err(err) => {
            warn!("button unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

fn spawn_console(
    device: SharedDevice,
    nvs_store: NvsStore,
    boot_network: NetworkConfig,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("console".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            let stdin = std::io::stdin();
            let mut pending = String::new();

            loop {
                match stdin.read_line(&mut pending) {
                    Ok(_) if pending.ends_with('\n') => {
                        let reply = console::dispatch(&pending, &mut lock(&device));
                        pending.clear();
                        if !reply.text.is_empty() {
                            println!("{}", reply.text);
                        }
                        if reply.effect == Effect::Save {
                            save_from_console(&device, &nvs_store, &boot_network);
                        }
                    }
                    Ok(_) => thread::sleep(Duration::from_millis(CONSOLE_POLL_MS)),
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(CONSOLE_POLL_MS));
                    }
                    Err(err) => {
                        warn!("console read failed: {err}");
                        pending.clear();
                        thread::sleep(Duration::from_millis(CONSOLE_POLL_MS));
                    }
                }
            }
        })
        .context("failed to spawn console thread")?;
    Ok(())
}

fn save_from_console(device: &SharedDevice, nvs_store: &NvsStore, boot_network: &NetworkConfig) {
    if let Err(err) = persist_all(nvs_store, device) {
        warn!("failed to save configuration: {err:#}");
        println!("Saving failed: {err:#}");
        return;
    }

    let network_changed = lock(device).runtime().network != *boot_network;
    if network_changed {
        println!("WiFi configuration saved. Restarting to connect using the new credentials.");
        thread::sleep(Duration::from_millis(100));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
    println!("Configuration saved.");
}

fn create_http_server(
    device: SharedDevice,
    nvs_store: NvsStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 12 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let device = device.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let status = {
                let device = lock(&device);
                device.status(device.now())
            };
            write_json(req, &status)
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler("/api/outlet/toggle", Method::Post, move |req| {
            let status = {
                let mut device = lock(&device);
                device.toggle();
                device.status(device.now())
            };
            write_json(req, &status)
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler("/api/outlet", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let on = match query_param(&uri, "value").map(|v| v.to_ascii_lowercase()) {
                Some(value) if value == "on" => true,
                Some(value) if value == "off" => false,
                _ => return write_error(req, 400, "Missing or invalid 'value' parameter"),
            };

            let status = {
                let mut device = lock(&device);
                device.set_outlet(on);
                device.status(device.now())
            };
            write_json(req, &status)
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler("/api/schedule", Method::Get, move |req| {
            let schedule = lock(&device).schedule().clone();
            write_json(req, &schedule)
        })?;
    }

    {
        let device = device.clone();
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/schedule", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let form = parse_form(&String::from_utf8_lossy(&body));

            let result = lock(&device).apply_form(&form);
            if let Err(err) = result {
                return write_error(req, 400, &err.to_string());
            }

            let blob = lock(&device).schedule_blob()?;
            nvs_store.save_schedule(&blob)?;
            let schedule = lock(&device).schedule().clone();
            write_json(req, &schedule)
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler::<anyhow::Error, _>("/api/cmd", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let form = parse_form(&String::from_utf8_lossy(&body));
            let Some(line) = form.get("cmd") else {
                return write_error(req, 400, "Missing 'cmd' field");
            };

            let reply = console::dispatch(line, &mut lock(&device));
            let mut text = reply.text;
            if reply.effect == Effect::Save {
                if let Err(err) = persist_all(&nvs_store, &device) {
                    warn!("failed to save configuration: {err:#}");
                    text.push_str("\nSaving failed.");
                }
            }

            write_json(req, &CommandReply { reply: text })
        })?;
    }

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    parse_form(query).remove(key)
}

/// Decode an `application/x-www-form-urlencoded` body.
fn parse_form(body: &str) -> HashMap<String, String> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(name), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

fn ipv4_from_octets(ip: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])
}

fn build_sta_netif(network: &NetworkConfig) -> anyhow::Result<Option<EspNetif>> {
    if !network.use_static_ip {
        return Ok(None);
    }

    let static_ip = network
        .static_ip
        .ok_or_else(|| anyhow!("staticIp is required when useStaticIp is true"))?;
    let gateway = network
        .gateway
        .ok_or_else(|| anyhow!("gateway is required when useStaticIp is true"))?;
    let subnet = network
        .subnet
        .ok_or_else(|| anyhow!("subnet is required when useStaticIp is true"))?;

    let mask_ip = ipv4_from_octets(subnet);
    let mask = Mask::try_from(mask_ip).map_err(|_| anyhow!("invalid subnet mask: {}", mask_ip))?;

    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip: ipv4_from_octets(static_ip),
                subnet: Subnet {
                    gateway: ipv4_from_octets(gateway),
                    mask,
                },
                dns: network.dns.map(ipv4_from_octets),
                secondary_dns: None,
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };

    Ok(Some(EspNetif::new_with_conf(&conf)?))
}

/// Join the configured network. `Ok(None)` means the device should run
/// without networking.
fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<Option<EspWifi<'static>>> {
    if !network.has_station_credentials() {
        warn!("no stored WiFi credentials; use `ssid`, `pw` and `save` on the console");
        return Ok(None);
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    if let Some(sta_netif) = build_sta_netif(network)? {
        esp_wifi
            .swap_netif_sta(sta_netif)
            .context("failed to apply static IP netif configuration")?;
    }

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect() {
            Ok(()) => match wifi.wait_netif_up() {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!("wifi netif up failed on attempt {attempt}: {err:#}");
                    last_err = Some(err);
                }
            },
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}");
        let _ = wifi.disconnect();
        let _ = wifi.stop();
        return Ok(None);
    }

    match wifi.wifi().sta_netif().get_ip_info() {
        Ok(ip_info) => info!("wifi connected, IP address is {}", ip_info.ip),
        Err(err) => warn!("wifi connected but IP info unavailable: {err}"),
    }
    drop(wifi);
    Ok(Some(esp_wifi))
}

fn persist_all(nvs_store: &NvsStore, device: &SharedDevice) -> anyhow::Result<()> {
    let (blob, runtime) = {
        let device = lock(device);
        (device.schedule_blob()?, device.runtime().clone())
    };
    nvs_store.save_schedule(&blob)?;
    nvs_store.save_runtime_config(&runtime)
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_BUFFER_SIZE];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }

    fn load_schedule(&self) -> anyhow::Result<Schedule> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_BUFFER_SIZE];

        let raw = nvs.get_raw(NVS_SCHEDULE_KEY, &mut buffer)?;
        Ok(persist::load_or_default(raw))
    }

    fn save_schedule(&self, blob: &[u8]) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        nvs.set_raw(NVS_SCHEDULE_KEY, blob)?;
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
