#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]

use defmt::{error, info, warn};
use esp_hal::clock::CpuClock;
use esp_hal::timer::timg::TimerGroup;
use panic_rtt_target as _;

use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer, with_timeout};

#[cfg(feature = "mqtt")]
use embassy_futures::select::{Either, select};
#[cfg(feature = "mqtt")]
use embassy_net::{Config as NetConfig, Stack, StackResources};
#[cfg(feature = "mqtt")]
use static_cell::StaticCell;

// Optional local secrets support
#[cfg(feature = "local_secrets")]
mod secrets;
#[cfg(feature = "local_secrets")]
use secrets::{WIFI_PASS as LOCAL_PASS, WIFI_SSID as LOCAL_SSID};

extern crate alloc;

use echo_node::link::{LinkOutcome, LinkStep, RetryPolicy};
use echo_node::mqtt::{build_echo_topic, respond};

#[cfg(not(feature = "mqtt"))]
use echo_node::mqtt::{LoggerPublisher, PING};
#[cfg(feature = "mqtt")]
use echo_node::mqtt::{
    EmbassyNetTransport, MqttSessionConfig, connect_rust_mqtt_session,
    keep_alive_ping_interval_secs,
};

#[cfg(feature = "mqtt")]
use rust_mqtt::packet::v5::reason_codes::ReasonCode;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

/// Device identifier, used as MQTT client id and topic namespace.
const DEVICE_ID: &str = "echo-node-01";

// MQTT configuration. The broker is a fixed public one; credentials,
// TLS and session tuning are deliberately out of scope.
#[cfg(feature = "mqtt")]
const MQTT_BROKER_HOST: &str = "broker.hivemq.com";
#[cfg(feature = "mqtt")]
const MQTT_BROKER_PORT: u16 = 1883;
#[cfg(feature = "mqtt")]
const MQTT_KEEP_ALIVE_SECS: u16 = 60;

/// How long one connect attempt may take before it counts as a failed
/// retry. A hung association would otherwise stall the boot gate.
const LINK_ATTEMPT_WINDOW: Duration = Duration::from_secs(10);

/// Fixed delay between broker sessions after an error. Flat on purpose;
/// a backoff curve is out of scope.
#[cfg(feature = "mqtt")]
const SESSION_RETRY_SECS: u64 = 5;

// Boot-time link gate: the echo task blocks here until the link either
// comes up or is abandoned. Replaces the classic two-bit event-group
// wait with a one-shot signal.
static LINK_OUTCOME: Signal<CriticalSectionRawMutex, LinkOutcome> = Signal::new();

// embassy-net stack resources (for the rust-mqtt session)
#[cfg(feature = "mqtt")]
static STACK_RESOURCES: StaticCell<StackResources<3>> = StaticCell::new();
#[cfg(feature = "mqtt")]
static NET_STACK: StaticCell<Stack<'static>> = StaticCell::new();

// ----------------------------------------------------------------------------
// Echo session error types
// ----------------------------------------------------------------------------

/// Unified error type for the broker session lifecycle stages.
#[cfg(feature = "mqtt")]
#[derive(defmt::Format)]
enum EchoSessionError {
    /// DNS query failed and the host is not a literal IP address
    DnsResolutionFailed,
    /// DNS returned no addresses and the host is not a literal IP address
    DnsNoAddresses,
    /// TCP connection failed
    TcpConnectionFailed,
    /// MQTT CONNECT handshake failed with a reason code
    MqttConnectFailed(ReasonCode),
    /// SUBSCRIBE to the echo topic failed
    SubscribeFailed(ReasonCode),
    /// Receiving an inbound PUBLISH failed
    ReceiveFailed(ReasonCode),
    /// Keep-alive PINGREQ failed
    KeepAliveFailed(ReasonCode),
    /// Publishing the pong reply failed
    ReplyPublishFailed(ReasonCode),
}

// ----------------------------------------------------------------------------
// Echo session helpers
// ----------------------------------------------------------------------------

/// Resolves the broker hostname to an IPv4 address, falling back to
/// parsing the host as a literal IP when DNS is unavailable.
#[cfg(feature = "mqtt")]
async fn resolve_broker_address(
    stack: &Stack<'static>,
    broker_host: &str,
) -> Result<embassy_net::Ipv4Address, EchoSessionError> {
    info!("mqtt: resolving broker hostname '{}'...", broker_host);

    match stack
        .dns_query(broker_host, embassy_net::dns::DnsQueryType::A)
        .await
    {
        Ok(addrs) if !addrs.is_empty() => {
            let embassy_net::IpAddress::Ipv4(ipv4) = addrs[0];
            info!("mqtt: resolved '{}' to {}", broker_host, ipv4);
            Ok(ipv4)
        }
        Ok(_) => {
            error!("mqtt: DNS resolution returned no addresses");
            broker_host
                .parse()
                .map_err(|_| EchoSessionError::DnsNoAddresses)
        }
        Err(e) => {
            error!("mqtt: DNS resolution failed: {:?}", defmt::Debug2Format(&e));
            broker_host
                .parse()
                .map_err(|_| EchoSessionError::DnsResolutionFailed)
        }
    }
}

/// Establishes a TCP connection to the broker. The buffers must
/// outlive the returned socket.
#[cfg(feature = "mqtt")]
async fn establish_tcp_connection<'a>(
    stack: &'a Stack<'static>,
    broker_addr: embassy_net::Ipv4Address,
    broker_port: u16,
    tcp_rx_buffer: &'a mut [u8],
    tcp_tx_buffer: &'a mut [u8],
) -> Result<embassy_net::tcp::TcpSocket<'a>, EchoSessionError> {
    let mut tcp_socket = embassy_net::tcp::TcpSocket::new(*stack, tcp_rx_buffer, tcp_tx_buffer);
    tcp_socket.set_timeout(Some(Duration::from_secs(10)));

    let remote_endpoint = (broker_addr, broker_port);
    info!("mqtt: connecting TCP to {}:{}...", broker_addr, broker_port);

    match tcp_socket.connect(remote_endpoint).await {
        Ok(()) => {
            info!("mqtt: TCP connected");
            Ok(tcp_socket)
        }
        Err(e) => {
            error!("mqtt: TCP connection failed: {:?}", defmt::Debug2Format(&e));
            Err(EchoSessionError::TcpConnectionFailed)
        }
    }
}

/// Runs one full broker session: resolve, dial, CONNECT, SUBSCRIBE,
/// then answer pings until the session errors out.
#[cfg(feature = "mqtt")]
async fn run_echo_session(
    stack: &'static Stack<'static>,
    echo_topic: &str,
) -> Result<(), EchoSessionError> {
    let broker_addr = resolve_broker_address(stack, MQTT_BROKER_HOST).await?;

    // Socket and packet buffers live on this frame and are dropped
    // when the session ends; 2 KiB each is ample for 4-byte payloads.
    let mut tcp_rx_buffer = [0u8; 2048];
    let mut tcp_tx_buffer = [0u8; 2048];
    let mut mqtt_recv_buffer = [0u8; 2048];
    let mut mqtt_write_buffer = [0u8; 2048];

    let tcp_socket = establish_tcp_connection(
        stack,
        broker_addr,
        MQTT_BROKER_PORT,
        &mut tcp_rx_buffer,
        &mut tcp_tx_buffer,
    )
    .await?;

    let transport = EmbassyNetTransport::new(tcp_socket);
    let session_config = MqttSessionConfig {
        client_id: DEVICE_ID,
        keep_alive_secs: MQTT_KEEP_ALIVE_SECS,
    };

    let mut session = connect_rust_mqtt_session(
        transport,
        session_config,
        &mut mqtt_recv_buffer,
        &mut mqtt_write_buffer,
    )
    .await
    .map_err(EchoSessionError::MqttConnectFailed)?;

    session
        .subscribe(echo_topic)
        .await
        .map_err(EchoSessionError::SubscribeFailed)?;

    info!("mqtt: echo service ready on topic='{}'", echo_topic);

    let ping_interval = Duration::from_secs(keep_alive_ping_interval_secs(MQTT_KEEP_ALIVE_SECS));

    loop {
        // rust-mqtt does not send PINGREQ while parked in receive, so
        // an idle subscriber has to drive the keep-alive itself or the
        // broker drops the connection at 1.5x the keep-alive interval.
        // Select between the next inbound message and the ping timer.
        let mut payload_buf = [0u8; 64];
        let payload_len = {
            // The received payload borrows the session's receive
            // buffer, so copy it out before publishing the reply.
            // Anything longer than the scratch buffer cannot equal
            // "ping" anyway.
            match select(session.receive(), Timer::after(ping_interval)).await {
                Either::First(received) => {
                    let (topic, payload) = received.map_err(EchoSessionError::ReceiveFailed)?;
                    info!("mqtt: message on topic='{}' len={}", topic, payload.len());
                    let n = payload.len().min(payload_buf.len());
                    payload_buf[..n].copy_from_slice(&payload[..n]);
                    Some(n)
                }
                Either::Second(()) => None,
            }
        };

        match payload_len {
            Some(n) => {
                respond(&mut session, echo_topic, &payload_buf[..n])
                    .await
                    .map_err(EchoSessionError::ReplyPublishFailed)?;
            }
            None => {
                session
                    .send_ping()
                    .await
                    .map_err(EchoSessionError::KeepAliveFailed)?;
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tasks
// ----------------------------------------------------------------------------

/// MQTT echo task: waits for the boot-time link verdict, then keeps a
/// broker session alive, answering `ping` with `pong`.
#[cfg(feature = "mqtt")]
#[embassy_executor::task]
async fn mqtt_echo_task(stack: &'static Stack<'static>) {
    info!("mqtt: echo task started, waiting for link...");

    match LINK_OUTCOME.wait().await {
        LinkOutcome::Up => info!("mqtt: link is up"),
        LinkOutcome::Failed => {
            // Link abandoned at boot. Nothing to escalate to; park.
            error!("mqtt: link abandoned, echo service not started");
            loop {
                Timer::after(Duration::from_secs(3600)).await;
            }
        }
    }

    let echo_topic = build_echo_topic(DEVICE_ID);
    info!(
        "mqtt: broker configured - {}:{}",
        MQTT_BROKER_HOST, MQTT_BROKER_PORT
    );
    info!("mqtt: client ID - {}", DEVICE_ID);

    loop {
        if let Err(e) = run_echo_session(stack, echo_topic.as_str()).await {
            error!(
                "mqtt: session ended: {:?}, retrying in {}s",
                e, SESSION_RETRY_SECS
            );
        }
        Timer::after(Duration::from_secs(SESSION_RETRY_SECS)).await;
    }
}

/// Log-only echo task used when the `mqtt` feature is disabled: runs a
/// synthetic ping through the responder so the flow can be exercised
/// without a broker.
#[cfg(not(feature = "mqtt"))]
#[embassy_executor::task]
async fn mqtt_echo_task() {
    info!("mqtt: echo task started, waiting for link...");

    match LINK_OUTCOME.wait().await {
        LinkOutcome::Up => info!("mqtt: link is up"),
        LinkOutcome::Failed => {
            error!("mqtt: link abandoned, echo service not started");
            loop {
                Timer::after(Duration::from_secs(3600)).await;
            }
        }
    }

    let echo_topic = build_echo_topic(DEVICE_ID);
    let mut publisher = LoggerPublisher;
    let _ = respond(&mut publisher, echo_topic.as_str(), PING).await;
    info!("mqtt: log-only mode active (enable mqtt feature for a real broker session)");

    loop {
        Timer::after(Duration::from_secs(60)).await;
    }
}

/// Embassy-net runner task: runs the network stack to process packets.
#[cfg(feature = "mqtt")]
#[embassy_executor::task]
async fn embassy_net_task(
    mut runner: embassy_net::Runner<'static, esp_radio::wifi::WifiDevice<'static>>,
) -> ! {
    runner.run().await
}

/// Waits for the controller to associate, bounded by the attempt
/// window. A timeout counts as a failed attempt.
async fn wait_for_association(wifi: &mut esp_radio::wifi::WifiController<'static>) -> bool {
    let associated = async {
        loop {
            if wifi.is_connected().unwrap_or(false) {
                break;
            }
            Timer::after(Duration::from_millis(100)).await;
        }
    };
    with_timeout(LINK_ATTEMPT_WINDOW, associated).await.is_ok()
}

/// Waits for DHCP to assign an address, watching the controller so a
/// link drop during the lease wait fails the attempt instead of
/// spinning forever on a dead link.
#[cfg(feature = "mqtt")]
async fn wait_for_lease(
    wifi: &mut esp_radio::wifi::WifiController<'static>,
    stack: &'static Stack<'static>,
) -> bool {
    info!("network: waiting for DHCP IP assignment...");
    loop {
        if stack.is_config_up()
            && let Some(config) = stack.config_v4()
        {
            info!(
                "network: DHCP assigned IP: {}, gateway: {}",
                config.address, config.gateway
            );
            return true;
        }
        if !wifi.is_connected().unwrap_or(false) {
            warn!("wifi: link lost while waiting for DHCP lease");
            return false;
        }
        Timer::after(Duration::from_millis(100)).await;
    }
}

/// Network task: brings the Wi-Fi station up under a bounded retry
/// policy and keeps supervising the link afterwards.
///
/// Every failed or lost connection consumes one retry; three retries
/// after the initial attempt, the link is abandoned with a log message
/// and `LinkOutcome::Failed` (no recovery path beyond that).
#[embassy_executor::task]
async fn network_task(
    mut wifi: esp_radio::wifi::WifiController<'static>,
    client_config: esp_radio::wifi::ClientConfig,
    #[cfg(feature = "mqtt")] stack: &'static Stack<'static>,
) {
    if let Err(e) = wifi.set_config(&esp_radio::wifi::ModeConfig::Client(client_config)) {
        error!("wifi: set_config failed: {:?}", e);
        LINK_OUTCOME.signal(LinkOutcome::Failed);
        return;
    }

    if let Err(e) = wifi.start() {
        error!("wifi: start failed: {:?}", e);
        LINK_OUTCOME.signal(LinkOutcome::Failed);
        return;
    }

    info!("wifi: started STA mode");

    let mut policy = RetryPolicy::default();
    let mut boot_gate_open = false;

    loop {
        let associated = match wifi.connect() {
            Ok(()) => wait_for_association(&mut wifi).await,
            Err(e) => {
                warn!("wifi: connect request failed: {:?}", e);
                false
            }
        };

        // When embassy-net is enabled, the link is only useful once
        // DHCP has assigned an address. Losing the link during the
        // lease wait counts against the retry budget like any other
        // disconnect.
        #[cfg(feature = "mqtt")]
        let link_up = associated && wait_for_lease(&mut wifi, stack).await;
        #[cfg(not(feature = "mqtt"))]
        let link_up = associated;

        if link_up {
            // The budget is only restored once the link is usable,
            // not on bare association.
            policy.on_connected();
            info!("wifi: connected");

            if !boot_gate_open {
                LINK_OUTCOME.signal(LinkOutcome::Up);
                boot_gate_open = true;
            }

            // Supervise until the link drops.
            loop {
                Timer::after(Duration::from_secs(5)).await;
                if !wifi.is_connected().unwrap_or(true) {
                    warn!("wifi: link lost");
                    break;
                }
            }
        }

        match policy.on_disconnected() {
            LinkStep::Retry => {
                info!(
                    "wifi: retry to connect to the AP ({}/{})",
                    policy.attempts(),
                    policy.max_retries()
                );
            }
            LinkStep::GiveUp => {
                error!(
                    "wifi: failed to connect after {} retries, giving up",
                    policy.max_retries()
                );
                if !boot_gate_open {
                    LINK_OUTCOME.signal(LinkOutcome::Failed);
                }
                return;
            }
        }
    }
}

#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_defmt!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 65536);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_interrupt =
        esp_hal::interrupt::software::SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_interrupt.software_interrupt0);

    // --- Wi‑Fi bring‑up (STA) ---------------------------------------------------------------
    // Credentials source options:
    // - Preferred: create a local, Git-ignored `src/secrets.rs` with:
    //     pub const WIFI_SSID: &str = "YourSSID";
    //     pub const WIFI_PASS: &str = "YourPassword";
    //   and build with `--features local_secrets`.
    // - Fallback: compile-time env vars `WIFI_SSID` / `WIFI_PASS`.

    #[cfg(feature = "local_secrets")]
    let (ssid, pass) = (LOCAL_SSID, LOCAL_PASS);
    #[cfg(not(feature = "local_secrets"))]
    let (ssid, pass) = (
        option_env!("WIFI_SSID").unwrap_or(""),
        option_env!("WIFI_PASS").unwrap_or(""),
    );

    if ssid.is_empty() {
        warn!("wifi: set WIFI_SSID/WIFI_PASS env vars at build time to enable STA connection");
    }

    // Radio bring-up failures are unrecoverable; log and abort.
    let radio_init = match esp_radio::init() {
        Ok(v) => v,
        Err(e) => {
            error!("wifi: esp_radio init failed: {:?}", e);
            panic!("radio initialization failed");
        }
    };
    let radio_init: &'static _ = {
        use alloc::boxed::Box;
        Box::leak(Box::new(radio_init))
    };

    let wifi_cfg = esp_radio::wifi::Config::default();
    let (wifi, ifaces) = match esp_radio::wifi::new(radio_init, peripherals.WIFI, wifi_cfg) {
        Ok(v) => v,
        Err(e) => {
            error!("wifi: new() failed: {:?}", e);
            panic!("wifi initialization failed");
        }
    };
    #[cfg(not(feature = "mqtt"))]
    let _ = ifaces;

    // Configure as Wi‑Fi station (client)
    let client_config = esp_radio::wifi::ClientConfig::default()
        .with_ssid(ssid.into())
        .with_password(pass.into());

    // --- embassy-net stack initialization ---
    // embassy-net wraps smoltcp with an async TCP/IP, DHCP and DNS API;
    // the Runner processes packets in its own task while the Stack
    // handle is shared with the echo session.
    #[cfg(feature = "mqtt")]
    let stack = {
        // 3 sockets: DHCP, DNS, MQTT.
        let resources = STACK_RESOURCES.init(StackResources::new());

        let (stack, runner) = embassy_net::new(
            ifaces.sta,
            NetConfig::dhcpv4(Default::default()),
            resources,
            embassy_time::Instant::now().as_millis(),
        );

        let stack = NET_STACK.init(stack);
        spawner.spawn(embassy_net_task(runner)).ok();
        info!("network: embassy-net stack initialized with DHCP");

        stack
    };

    #[cfg(feature = "mqtt")]
    spawner.spawn(network_task(wifi, client_config, stack)).ok();
    #[cfg(not(feature = "mqtt"))]
    spawner.spawn(network_task(wifi, client_config)).ok();

    #[cfg(feature = "mqtt")]
    spawner.spawn(mqtt_echo_task(stack)).ok();
    #[cfg(not(feature = "mqtt"))]
    spawner.spawn(mqtt_echo_task()).ok();

    info!("application: all tasks spawned");
    info!("application: device_id={}", DEVICE_ID);

    loop {
        Timer::after(Duration::from_secs(3600)).await;
    }
}
