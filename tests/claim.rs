//! End-to-end claim flow: a served API, a fake relay holding the receipt,
//! and real signed artifacts.

use assert_cmd::prelude::*;
use bitcoin::hashes::{sha256, Hash};
use futures_util::{SinkExt, StreamExt};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};
use secp256k1::{Keypair, Message, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::{
    fs,
    net::TcpListener as StdTcpListener,
    process::Command,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tempfile::TempDir;
use tokio::{net::TcpListener, task, time::sleep};
use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn keypair(seed: u8) -> Keypair {
    let secp = Secp256k1::new();
    Keypair::from_seckey_slice(&secp, &[seed; 32]).unwrap()
}

fn pubkey_hex(kp: &Keypair) -> String {
    hex::encode(kp.x_only_public_key().0.serialize())
}

/// Fill in `id` and `sig` from the event's canonical serialization.
fn sign_event(mut ev: serde_json::Value, kp: &Keypair) -> serde_json::Value {
    let secp = Secp256k1::new();
    let arr = serde_json::json!([
        0,
        ev["pubkey"],
        ev["created_at"],
        ev["kind"],
        ev["tags"],
        ev["content"],
    ]);
    let hash = Sha256::digest(serde_json::to_vec(&arr).unwrap());
    let msg = Message::from_digest_slice(&hash).unwrap();
    let sig = secp.sign_schnorr_no_aux_rand(&msg, kp);
    ev["id"] = serde_json::Value::String(hex::encode(hash));
    ev["sig"] = serde_json::Value::String(hex::encode(sig.as_ref()));
    ev
}

/// Real signed invoice committing to `description` by hash.
fn test_invoice(amount_msats: u64, description: &str) -> String {
    let secp = Secp256k1::new();
    let key = SecretKey::from_slice(&[41u8; 32]).unwrap();
    let desc_hash: [u8; 32] = Sha256::digest(description.as_bytes()).into();
    InvoiceBuilder::new(Currency::Bitcoin)
        .description_hash(sha256::Hash::from_byte_array(desc_hash))
        .payment_hash(sha256::Hash::from_byte_array([3u8; 32]))
        .payment_secret(PaymentSecret([42u8; 32]))
        .amount_milli_satoshis(amount_msats)
        .duration_since_epoch(Duration::from_secs(unix_now()))
        .min_final_cltv_expiry_delta(144)
        .build_signed(|hash| secp.sign_ecdsa_recoverable(hash, &key))
        .unwrap()
        .to_string()
}

/// Signed zap request and matching receipt for 5000 sats on resource `r1`.
fn zap_pair(payer: &Keypair, owner: &Keypair, wallet: &Keypair) -> (serde_json::Value, serde_json::Value) {
    let now = unix_now();
    let request = sign_event(
        serde_json::json!({
            "pubkey": pubkey_hex(payer),
            "kind": 9734,
            "created_at": now - 5,
            "tags": [
                ["p", pubkey_hex(owner)],
                ["a", format!("30402:{}:r1", pubkey_hex(owner))],
                ["amount", "5000000"],
            ],
            "content": "",
        }),
        payer,
    );
    let request_json = request.to_string();
    let bolt11 = test_invoice(5_000_000, &request_json);
    let receipt = sign_event(
        serde_json::json!({
            "pubkey": pubkey_hex(wallet),
            "kind": 9735,
            "created_at": now,
            "tags": [
                ["bolt11", bolt11],
                ["description", request_json],
            ],
            "content": "",
        }),
        wallet,
    );
    (request, receipt)
}

/// Relay that answers `REQ` with the held event when ids match, then EOSE.
async fn spawn_fake_relay(event: serde_json::Value) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    task::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let event = event.clone();
            task::spawn(async move {
                let mut ws = accept_async(stream).await.unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    if let TMsg::Text(text) = msg {
                        let req: serde_json::Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        let subid = req[1].as_str().unwrap_or("s").to_string();
                        let wanted = req[2]["ids"][0].as_str().unwrap_or_default();
                        if event["id"].as_str() == Some(wanted) {
                            let out = serde_json::json!(["EVENT", subid, event]);
                            ws.send(TMsg::Text(out.to_string())).await.unwrap();
                        }
                        let eose = serde_json::json!(["EOSE", subid]);
                        ws.send(TMsg::Text(eose.to_string())).await.unwrap();
                    }
                }
            });
        }
    });
    format!("ws://{addr}")
}

struct Server {
    child: std::process::Child,
    base: String,
    dir: TempDir,
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

async fn spawn_server(relay_url: &str) -> Server {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let env_path = dir.path().join("env");
    fs::write(
        &env_path,
        format!(
            concat!(
                "STORE_ROOT={}\n",
                "BIND_HTTP=127.0.0.1:{}\n",
                "DEFAULT_RELAYS={}\n",
                "FETCH_ATTEMPTS=2\n",
                "FETCH_INTERVAL_MS=100\n",
                "ADMIN_TOKEN=sekrit\n",
            ),
            dir.path().display(),
            port,
            relay_url
        ),
    )
    .unwrap();

    let child = Command::cargo_bin("zapgate")
        .unwrap()
        .args(["--env", env_path.to_str().unwrap(), "serve"])
        .spawn()
        .unwrap();
    sleep(Duration::from_millis(500)).await;
    Server {
        child,
        base: format!("http://127.0.0.1:{port}"),
        dir,
    }
}

fn write_listing(server: &Server, owner: &Keypair) {
    let prices = server.dir.path().join("prices");
    fs::create_dir_all(&prices).unwrap();
    fs::write(
        prices.join("resource.r1.json"),
        serde_json::json!({
            "price_sats": 5000,
            "owner_pubkey": pubkey_hex(owner),
            "event_id": null,
        })
        .to_string(),
    )
    .unwrap();
}

#[tokio::test]
async fn claim_by_id_end_to_end() {
    let payer = keypair(7);
    let owner = keypair(8);
    let wallet = keypair(9);
    let (_request, receipt) = zap_pair(&payer, &owner, &wallet);
    let receipt_id = receipt["id"].as_str().unwrap().to_string();

    let relay_url = spawn_fake_relay(receipt).await;
    let server = spawn_server(&relay_url).await;
    write_listing(&server, &owner);

    let client = reqwest::Client::new();
    let body = serde_json::json!({
        "payer_id": "alice",
        "payer_pubkeys": [pubkey_hex(&payer)],
        "resource": "r1",
        "receipt_ids": [receipt_id],
    });

    // first claim fetches the receipt from the relay and unlocks
    let resp = client
        .post(format!("{}/claim", server.base))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let claimed: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(claimed["outcome"], "created", "{claimed}");
    assert_eq!(claimed["unlocked"], true);
    assert_eq!(claimed["purchase"]["amount_paid"], 5000);

    // blind retry is a no-op
    let resp = client
        .post(format!("{}/claim", server.base))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let retried: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(retried["outcome"], "already_owned");

    // the same receipt cannot unlock for another account
    let mut stolen = body.clone();
    stolen["payer_id"] = "mallory".into();
    let resp = client
        .post(format!("{}/claim", server.base))
        .json(&stolen)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 409);

    // lookup reflects the recorded purchase
    let resp = client
        .get(format!("{}/purchase?payer=alice&resource=r1", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let lookup: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(lookup["unlocked"], true);
    assert_eq!(lookup["purchase"]["receipts"][0]["id"], claimed["purchase"]["receipt_id"]);
}

#[tokio::test]
async fn default_relays_polled_alongside_caller_hints() {
    let payer = keypair(7);
    let owner = keypair(8);
    let wallet = keypair(9);
    let (_request, receipt) = zap_pair(&payer, &owner, &wallet);
    let receipt_id = receipt["id"].as_str().unwrap().to_string();

    // receipt lives only on the configured relay, not on the caller's hint
    let relay_url = spawn_fake_relay(receipt).await;
    let server = spawn_server(&relay_url).await;
    write_listing(&server, &owner);

    let client = reqwest::Client::new();
    let body = serde_json::json!({
        "payer_id": "alice",
        "payer_pubkeys": [pubkey_hex(&payer)],
        "resource": "r1",
        "receipt_ids": [receipt_id],
        "relays": ["ws://127.0.0.1:1"],
    });
    let resp = client
        .post(format!("{}/claim", server.base))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let claimed: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(claimed["outcome"], "created", "{claimed}");
    assert_eq!(claimed["unlocked"], true);
}

#[tokio::test]
async fn unknown_receipt_id_is_unavailable() {
    let relay_url = spawn_fake_relay(serde_json::json!({"id": "none"})).await;
    let server = spawn_server(&relay_url).await;
    write_listing(&server, &keypair(8));

    let client = reqwest::Client::new();
    let body = serde_json::json!({
        "payer_id": "alice",
        "payer_pubkeys": [pubkey_hex(&keypair(7))],
        "resource": "r1",
        "receipt_ids": ["ab".repeat(32)],
    });
    let resp = client
        .post(format!("{}/claim", server.base))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 503);
}

#[tokio::test]
async fn admin_claim_over_http() {
    let relay_url = spawn_fake_relay(serde_json::json!({"id": "none"})).await;
    let server = spawn_server(&relay_url).await;

    let client = reqwest::Client::new();
    let body = serde_json::json!({
        "payer_id": "carol",
        "resource": "r9",
        "payment_type": "comped",
        "amount_sats": 0,
        "reason": "beta tester",
    });
    let resp = client
        .post(format!("{}/claim", server.base))
        .header("x-admin-token", "sekrit")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let claimed: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(claimed["purchase"]["payment_type"], "comped");
    assert_eq!(claimed["purchase"]["reason"], "beta tester");
}
