//! Session lifecycle: idle expiry, close semantics, migration epochs,
//! and limiter-token accounting in the manager.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use edgegram::metrics::NoopMetrics;
use edgegram::origin::{CountingLimiter, NetDialer, UdpOriginDialer};
use edgegram::session::{
    RegisterError, Session, SessionError, SessionManager, DEFAULT_IDLE_TIMEOUT,
};

use common::{edge_conn, registration, rid};

async fn session_over(
    origin_dest: std::net::SocketAddr,
    conn: Arc<common::EdgeConn>,
    token: CancellationToken,
    idle_hint: Duration,
) -> Arc<Session> {
    let socket = NetDialer.dial_udp(origin_dest).await.unwrap();
    Session::new(
        rid(),
        socket,
        conn,
        token,
        0,
        idle_hint,
        Arc::new(NoopMetrics),
    )
}

#[tokio::test(start_paused = true)]
async fn idle_timer_ends_the_session() {
    let origin = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (conn, _edge) = edge_conn();
    let token = CancellationToken::new();

    let session = session_over(
        origin.local_addr().unwrap(),
        conn,
        token,
        Duration::from_secs(3),
    )
    .await;

    let started = tokio::time::Instant::now();
    let err = session.serve().await.unwrap_err();
    assert!(matches!(err, SessionError::Idle(d) if d == Duration::from_secs(3)));
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test]
async fn zero_idle_hint_means_default() {
    let origin = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (conn, _edge) = edge_conn();
    let session = session_over(
        origin.local_addr().unwrap(),
        conn,
        CancellationToken::new(),
        Duration::ZERO,
    )
    .await;
    assert_eq!(session.idle_timeout(), DEFAULT_IDLE_TIMEOUT);
}

#[tokio::test(start_paused = true)]
async fn activity_resets_the_idle_timer() {
    let origin = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (conn, _edge) = edge_conn();
    let session = session_over(
        origin.local_addr().unwrap(),
        conn,
        CancellationToken::new(),
        Duration::from_secs(10),
    )
    .await;

    let keeper = session.clone();
    tokio::spawn(async move {
        // Nudge the timer three times, then let it lapse.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(6)).await;
            keeper.reset_idle_timer();
        }
    });

    let started = tokio::time::Instant::now();
    let err = session.serve().await.unwrap_err();
    assert!(matches!(err, SessionError::Idle(_)));
    // Three resets at six-second spacing push expiry past 24 seconds.
    assert!(started.elapsed() >= Duration::from_secs(24));
}

#[tokio::test]
async fn close_is_idempotent_and_ends_serve() {
    let origin = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (conn, _edge) = edge_conn();
    let session = session_over(
        origin.local_addr().unwrap(),
        conn,
        CancellationToken::new(),
        Duration::from_secs(30),
    )
    .await;

    let serving = tokio::spawn(session.clone().serve());
    tokio::time::sleep(Duration::from_millis(20)).await;

    session.close();
    session.close();
    assert!(session.is_closed());

    let err = timeout(Duration::from_secs(1), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SessionError::Closed));

    // Writes after close are refused.
    assert!(session.write(b"late").await.is_err());
}

#[tokio::test]
async fn write_delivers_exactly_once() {
    let origin = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (conn, _edge) = edge_conn();
    let session = session_over(
        origin.local_addr().unwrap(),
        conn,
        CancellationToken::new(),
        Duration::from_secs(30),
    )
    .await;

    session.write(b"exactly once").await.unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = timeout(Duration::from_secs(1), origin.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"exactly once");

    // Nothing else arrives.
    let more = timeout(Duration::from_millis(100), origin.recv_from(&mut buf)).await;
    assert!(more.is_err());
}

#[tokio::test]
async fn stale_connection_token_is_ignored_after_migration() {
    let origin = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (conn_a, _edge_a) = edge_conn();
    let (conn_b, _edge_b) = edge_conn();
    let token_a = CancellationToken::new();
    let token_b = CancellationToken::new();

    let session = session_over(
        origin.local_addr().unwrap(),
        conn_a,
        token_a.clone(),
        Duration::from_secs(30),
    )
    .await;

    let serving = tokio::spawn(session.clone().serve());
    tokio::time::sleep(Duration::from_millis(20)).await;

    session.migrate(conn_b, token_b.clone(), 1);
    assert_eq!(session.conn_index(), 1);

    // The old owner's cancellation no longer terminates the session.
    token_a.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!serving.is_finished());

    // The new owner's does.
    token_b.cancel();
    let err = timeout(Duration::from_secs(1), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SessionError::ConnectionClosed));
}

#[tokio::test]
async fn limiter_tokens_match_live_sessions() {
    let origin = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dest = origin.local_addr().unwrap();

    let limiter = Arc::new(CountingLimiter::new(2));
    let manager = SessionManager::new(
        Arc::new(NetDialer),
        limiter.clone(),
        Arc::new(NoopMetrics),
    );

    let (conn, _edge) = edge_conn();
    let token = CancellationToken::new();

    let first = registration(dest, Duration::ZERO);
    manager
        .register_session(&first, conn.clone(), token.clone(), 0)
        .await
        .unwrap();
    assert_eq!(limiter.active(), 1);
    assert_eq!(manager.session_count(), 1);

    let mut second = first.clone();
    second.id = edgegram::types::RequestId::from_parts(1, 2);
    manager
        .register_session(&second, conn.clone(), token.clone(), 0)
        .await
        .unwrap();
    assert_eq!(limiter.active(), 2);

    // Capacity reached: the next admission is rate limited and the map
    // is untouched.
    let mut third = first.clone();
    third.id = edgegram::types::RequestId::from_parts(3, 4);
    let err = manager
        .register_session(&third, conn.clone(), token.clone(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, RegisterError::RateLimited));
    assert_eq!(manager.session_count(), 2);

    // Unregister releases exactly one token and is idempotent.
    manager.unregister_session(first.id);
    assert_eq!(limiter.active(), 1);
    manager.unregister_session(first.id);
    assert_eq!(limiter.active(), 1);
    manager.unregister_session(second.id);
    assert_eq!(limiter.active(), 0);
    assert_eq!(manager.session_count(), 0);
}

#[tokio::test]
async fn duplicate_registration_reports_the_owning_connection() {
    let origin = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dest = origin.local_addr().unwrap();

    let limiter = Arc::new(CountingLimiter::new(4));
    let manager = SessionManager::new(
        Arc::new(NetDialer),
        limiter.clone(),
        Arc::new(NoopMetrics),
    );

    let (conn, _edge) = edge_conn();
    let token = CancellationToken::new();
    let reg = registration(dest, Duration::ZERO);

    manager
        .register_session(&reg, conn.clone(), token.clone(), 0)
        .await
        .unwrap();

    let same_conn = manager
        .register_session(&reg, conn.clone(), token.clone(), 0)
        .await
        .unwrap_err();
    assert!(matches!(same_conn, RegisterError::AlreadyRegistered));

    let other_conn = manager
        .register_session(&reg, conn.clone(), token.clone(), 1)
        .await
        .unwrap_err();
    assert!(matches!(other_conn, RegisterError::BoundToOtherConn));

    // Failed admissions never leak limiter tokens.
    assert_eq!(limiter.active(), 1);
}
