//! Integration tests for the ledger engine
//!
//! These tests drive the assembled engine through its public surface against
//! the in-memory store and chain, with a manual clock.

use chrono::{Duration, TimeZone, Utc};
use ledger_engine::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

struct TestEngine {
    engine: LedgerEngine<MemoryLedgerStore>,
    store: Arc<MemoryLedgerStore>,
    chain: MemoryChainReader,
    clock: Arc<ManualClock>,
    notifier: MemoryNotifier,
}

/// Engine on development settings with every collaborator in memory
async fn create_test_engine() -> TestEngine {
    let store = Arc::new(MemoryLedgerStore::new());
    let chain = MemoryChainReader::new();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
    let notifier = MemoryNotifier::new();

    let engine = LedgerEngine::builder()
        .config(EngineConfig::development())
        .store(store.clone())
        .chain(Arc::new(chain.clone()))
        .clock(clock.clone())
        .notifier(Arc::new(notifier.clone()))
        .build()
        .await
        .unwrap();

    TestEngine {
        engine,
        store,
        chain,
        clock,
        notifier,
    }
}

async fn create_user(t: &TestEngine) -> UserId {
    let user = User {
        id: Uuid::new_v4(),
        email: "investor@example.com".to_string(),
        referrer_id: None,
    };
    t.store.save_user(&user).await.unwrap();
    user.id
}

fn deposit(t: &TestEngine, hash: &str, to: &str, amount: Decimal, confirmations: u32) {
    t.chain.insert(ChainTransfer {
        tx_hash: hash.to_string(),
        network: Network::Bep20,
        from: "0x1111111111111111111111111111111111111111".to_string(),
        to: to.to_string(),
        amount,
        block_number: 40_000_000,
        confirmations,
        status: TransferStatus::Confirmed,
        timestamp: t.clock.now(),
    });
}

async fn ran(t: &TestEngine, kind: JobKind) -> JobReport {
    match t.engine.trigger(kind).await.unwrap() {
        TriggerOutcome::Ran(report) => report,
        TriggerOutcome::Skipped => panic!("{} unexpectedly skipped", kind),
    }
}

/// Pays for a pending bot and a pending package, both of `package_type`
async fn fund_package(t: &TestEngine, user: UserId, package_type: PackageType, amount: i64) -> (PackageId, BotId) {
    let now = t.clock.now();
    let bot = BotActivation::pending(user, package_type, now);
    t.store.save_bot(&bot).await.unwrap();
    let package = Package::pending(user, package_type, Decimal::from(amount), Network::Bep20, now);
    t.store.save_package(&package).await.unwrap();

    let gateway = t.engine.gateway();
    let (bot_request, _) = gateway
        .create_payment_request(user, PaymentPurpose::BotActivation, Decimal::from(50), Network::Bep20, LinkedEntity::Bot(bot.id))
        .await
        .unwrap();
    let (package_request, descriptor) = gateway
        .create_payment_request(user, PaymentPurpose::PackagePurchase, Decimal::from(amount), Network::Bep20, LinkedEntity::Package(package.id))
        .await
        .unwrap();
    assert!(descriptor.uri.starts_with("ethereum:"));

    deposit(t, &format!("0xbot{}", bot.id.simple()), &bot_request.deposit_address, Decimal::from(50), 20);
    deposit(t, &format!("0xpkg{}", package.id.simple()), &package_request.deposit_address, Decimal::from(amount), 20);
    assert_eq!(ran(t, JobKind::PaymentScan).await.succeeded, 2);

    assert_eq!(gateway.get_status(&bot_request.id).await.unwrap().status, PaymentStatus::Completed);
    assert_eq!(gateway.get_status(&package_request.id).await.unwrap().status, PaymentStatus::Completed);
    (package.id, bot.id)
}

// ============ Payment Lifecycle Tests ============

#[tokio::test]
async fn test_deposit_activates_package_and_notifies() {
    let t = create_test_engine().await;
    let user = create_user(&t).await;
    let (package_id, bot_id) = fund_package(&t, user, PackageType::Neo, 1000).await;

    let package = t.store.get_package(&package_id).await.unwrap().unwrap();
    assert_eq!(package.status, PackageStatus::Active);
    assert_eq!(package.expiry_date, t.clock.now() + Duration::days(360));
    let bot = t.store.get_bot(&bot_id).await.unwrap().unwrap();
    assert_eq!(bot.status, BotStatus::Active);
    assert_eq!(bot.expiry_date, t.clock.now() + Duration::days(365));

    let deposits: Vec<_> = t
        .store
        .list_transactions(&user)
        .await
        .unwrap()
        .into_iter()
        .filter(|tx| tx.tx_type == TransactionType::Deposit)
        .collect();
    assert_eq!(deposits.len(), 2);
    assert!(deposits.iter().all(|tx| tx.verified && tx.status == TransactionStatus::Completed));

    let sent = t.notifier.sent().await;
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|n| n.to == "investor@example.com"));
}

#[tokio::test]
async fn test_unpaid_request_expires_and_ignores_late_deposit() {
    let t = create_test_engine().await;
    let user = create_user(&t).await;
    let gateway = t.engine.gateway();
    let (request, _) = gateway
        .create_payment_request(user, PaymentPurpose::ManualDeposit, Decimal::from(100), Network::Bep20, LinkedEntity::None)
        .await
        .unwrap();

    t.clock.advance(Duration::minutes(31));
    assert_eq!(gateway.get_status(&request.id).await.unwrap().status, PaymentStatus::Expired);
    assert!(gateway.expire_old_requests().await.unwrap().is_empty());

    deposit(&t, "0xlate", &request.deposit_address, Decimal::from(100), 30);
    ran(&t, JobKind::PaymentScan).await;
    assert_eq!(gateway.get_status(&request.id).await.unwrap().status, PaymentStatus::Expired);
    assert!(t.store.find_transaction_by_hash("0xlate").await.unwrap().is_none());
}

#[tokio::test]
async fn test_manual_verification_requires_approval() {
    let t = create_test_engine().await;
    let user = create_user(&t).await;
    let gateway = t.engine.gateway();
    let (request, _) = gateway
        .create_payment_request(user, PaymentPurpose::ManualDeposit, Decimal::from(250), Network::Bep20, LinkedEntity::None)
        .await
        .unwrap();

    assert!(matches!(
        gateway.manually_verify(&request.id, "0xmissing").await,
        Err(LedgerError::VerificationFailed(_))
    ));

    deposit(&t, "0xreported", &request.deposit_address, Decimal::from(250), 2);
    let snapshot = gateway.manually_verify(&request.id, "0xreported").await.unwrap();
    assert_eq!(snapshot.status, PaymentStatus::AwaitingAdminApproval);

    // Discovery leaves requests awaiting an operator alone
    ran(&t, JobKind::PaymentScan).await;
    assert_eq!(gateway.get_status(&request.id).await.unwrap().status, PaymentStatus::AwaitingAdminApproval);

    let snapshot = gateway.approve_manual(&request.id).await.unwrap();
    assert_eq!(snapshot.status, PaymentStatus::Completed);
    let deposit = t.store.find_transaction_by_hash("0xreported").await.unwrap().unwrap();
    assert_eq!(deposit.status, TransactionStatus::Completed);
}

// ============ ROI & Expiration Tests ============

#[tokio::test]
async fn test_roi_pays_configured_percentage() {
    let t = create_test_engine().await;
    t.store.put_setting("NEO_ROI_PERCENTAGE", "3").await.unwrap();
    let user = create_user(&t).await;
    let (package_id, _) = fund_package(&t, user, PackageType::Neo, 1000).await;

    assert_eq!(ran(&t, JobKind::RoiPayout).await.succeeded, 0);
    t.clock.advance(Duration::days(30));
    assert_eq!(ran(&t, JobKind::RoiPayout).await.succeeded, 1);
    assert_eq!(ran(&t, JobKind::RoiPayout).await.succeeded, 0);

    let package = t.store.get_package(&package_id).await.unwrap().unwrap();
    assert_eq!(package.roi_paid_count, 1);
    assert_eq!(package.total_roi_paid, Decimal::from(30));
    let payments = t.store.list_roi_payments(&package_id).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!((payments[0].amount, payments[0].month_number), (Decimal::from(30), 1));
    let roi_earnings = t
        .store
        .list_earnings(&user)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.earning_type == EarningType::Roi)
        .count();
    assert_eq!(roi_earnings, 1);
}

#[tokio::test]
async fn test_demo_package_runs_full_term_then_returns_capital_once() {
    let t = create_test_engine().await;
    let user = create_user(&t).await;
    let (package_id, _) = fund_package(&t, user, PackageType::Demo, 200).await;
    let interval = t.engine.config().roi.interval_for(PackageType::Demo);

    let mut last_count = 0;
    for _ in 0..14 {
        t.clock.advance(interval);
        ran(&t, JobKind::RoiPayout).await;
        let package = t.store.get_package(&package_id).await.unwrap().unwrap();
        assert!(package.roi_paid_count >= last_count);
        assert!(package.roi_paid_count <= MAX_ROI_PAYMENTS);
        last_count = package.roi_paid_count;
    }
    assert_eq!(last_count, MAX_ROI_PAYMENTS);

    assert_eq!(ran(&t, JobKind::Expiration).await.succeeded, 1);
    assert_eq!(ran(&t, JobKind::Expiration).await.succeeded, 0);

    let package = t.store.get_package(&package_id).await.unwrap().unwrap();
    assert_eq!(package.status, PackageStatus::Expired);
    assert!(package.is_expired);
    let capital_returns: Vec<_> = t
        .store
        .list_transactions(&user)
        .await
        .unwrap()
        .into_iter()
        .filter(|tx| tx.tx_type == TransactionType::CapitalReturn)
        .collect();
    assert_eq!(capital_returns.len(), 1);
    assert_eq!(capital_returns[0].amount, Decimal::from(200));
}

// ============ Audit & Referral Tests ============

#[tokio::test]
async fn test_blockchain_sync_flags_discrepancy() {
    let t = create_test_engine().await;
    let user = create_user(&t).await;
    let tx = Transaction::new(user, TransactionType::Deposit, Decimal::from(100), TransactionStatus::Pending, "legacy deposit", t.clock.now())
        .on_chain(Network::Bep20, "0xshortpaid");
    t.store.insert_transaction(&tx).await.unwrap();
    deposit(&t, "0xshortpaid", "0xanywhere", Decimal::new(995, 1), 50);
    t.chain.set_head(Network::Bep20, 40_000_050);

    ran(&t, JobKind::BlockchainSync).await;

    let tx = t.store.get_transaction(&tx.id).await.unwrap().unwrap();
    assert!(!tx.verified);
    assert_eq!(tx.amount, Decimal::from(100));
    assert!(tx.audit_note.unwrap().contains("discrepancy"));
    let cursor = t.store.get_scan_state(Network::Bep20).await.unwrap().unwrap();
    assert_eq!(cursor.last_scanned_block, 40_000_050);
    assert_eq!(t.engine.stats().await.unwrap().metrics.audit_discrepancies, 1);
}

#[tokio::test]
async fn test_referral_dispatch_and_distribution() {
    let t = create_test_engine().await;
    let package_id = Uuid::new_v4();
    for level in 1..=2u8 {
        let referrer = Uuid::new_v4();
        let tx = Transaction::new(referrer, TransactionType::ReferralCommission, Decimal::from(5), TransactionStatus::Pending, "referral", t.clock.now());
        let earning = Earning::new(referrer, EarningType::LevelReferral, Decimal::from(5), EarningStatus::Pending, "referral", t.clock.now())
            .for_package(package_id)
            .paired_with(tx.id)
            .at_level(level);
        t.store.insert_transaction(&tx).await.unwrap();
        t.store.insert_earning(&earning).await.unwrap();
    }

    assert_eq!(ran(&t, JobKind::ReferralDispatch).await.succeeded, 1);
    assert_eq!(t.engine.drain_referrals().await.succeeded, 1);
    assert!(t.store.list_undistributed_referrals(&package_id).await.unwrap().is_empty());
    assert_eq!(ran(&t, JobKind::ReferralDispatch).await.processed, 0);
}

// ============ Orchestrator Tests ============

#[tokio::test]
async fn test_engine_start_stop_and_status() {
    let t = create_test_engine().await;
    t.engine.start().await.unwrap();
    assert_eq!(t.engine.status().await, ServiceStatus::Running);
    assert!(t.engine.start().await.is_err());

    ran(&t, JobKind::SessionCleanup).await;
    t.engine.stop().await;
    assert_eq!(t.engine.status().await, ServiceStatus::Stopped);

    let stats = t.engine.stats().await.unwrap();
    assert_eq!(stats.jobs.len(), JobKind::all().len());
    let cleanup = stats.jobs.iter().find(|j| j.kind == JobKind::SessionCleanup).unwrap();
    assert_eq!(cleanup.runs, 1);
    assert!(t.engine.prometheus_metrics().await.contains("ledger_job_runs_total"));
}

#[tokio::test]
async fn test_store_outage_fails_run_without_wedging_guard() {
    let t = create_test_engine().await;
    t.store.set_unavailable(true);
    assert!(t.engine.trigger(JobKind::RoiPayout).await.is_err());

    t.store.set_unavailable(false);
    ran(&t, JobKind::RoiPayout).await;
    let status = t.engine.orchestrator().status(JobKind::RoiPayout).await.unwrap();
    assert_eq!((status.runs, status.failures), (2, 1));
    assert!(status.last_error.is_none());
}
