//! Repository flows against PostgreSQL
//!
//! These tests require a PostgreSQL database and are marked with #[ignore] for CI.
//! Run with: TEST_DATABASE_URL=postgres://... cargo test --test postgres_tests -- --ignored

use datajpa_common::{AppConfig, PageRequest, SessionConfig, Sort};
use datajpa_domain::{Member, Team};
use datajpa_infrastructure::{
    CrudRepository, Error, InvalidationPolicy, MemberRepository, SessionFactory,
    SessionMemberRepository, SessionTeamRepository, Store,
};
use datajpa_testing::{create_members_with_ages, TestDatabase};
use once_cell::sync::Lazy;
use tokio::sync::Mutex;

// the tests share one database
static SERIAL: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

async fn database() -> TestDatabase {
    datajpa_common::telemetry::init_test_tracing();
    let db = TestDatabase::from_env().await.unwrap();
    db.clean().await.unwrap();
    db
}

#[tokio::test]
#[ignore]
async fn test_save_commit_and_reload() {
    let _serial = SERIAL.lock().await;
    let db = database().await;
    let factory = db.factory();

    let teams = SessionTeamRepository::new(factory.open());
    let team = teams.save(Team::new("teamA")).await.unwrap();
    let members = SessionMemberRepository::new(teams.session().clone());
    let member = members
        .save(Member::with_team("member1", 10, &team))
        .await
        .unwrap();
    teams.session().commit().await.unwrap();

    let reader = SessionMemberRepository::new(factory.open());
    let loaded = reader.get_by_id(member.id.unwrap()).await.unwrap();
    assert_eq!(loaded.username, "member1");
    assert_eq!(loaded.team_id, team.id);

    let joined = reader.find_member_fetch_join().await.unwrap();
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0].team.as_ref().map(|t| t.name.as_str()), Some("teamA"));
}

#[tokio::test]
#[ignore]
async fn test_page_and_bulk_update() {
    let _serial = SERIAL.lock().await;
    let db = database().await;
    let members = SessionMemberRepository::new(db.factory().open());

    members
        .save_all(create_members_with_ages(&[10, 10, 10, 10, 10]))
        .await
        .unwrap();
    let request = PageRequest::of_sorted(0, 3, Sort::desc("username"));
    let page = members.find_by_age(10, &request).await.unwrap();
    assert_eq!(page.content.len(), 3);
    assert_eq!(page.total_elements, 5);
    assert_eq!(page.content[0].username, "member5");

    let affected = members
        .bulk_age_plus(10, InvalidationPolicy::ClearSession)
        .await
        .unwrap();
    assert_eq!(affected, 5);
    assert_eq!(members.count_by_age(11).await.unwrap(), 5);
    members.session().rollback().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_lock_timeout_between_sessions() {
    let _serial = SERIAL.lock().await;
    let db = database().await;
    let factory = SessionFactory::new(db.store()).with_config(SessionConfig {
        lock_timeout_ms: 100,
        ..SessionConfig::default()
    });

    let setup = SessionMemberRepository::new(factory.open());
    setup.save(Member::with_age("member1", 10)).await.unwrap();
    setup.session().commit().await.unwrap();

    let holder = SessionMemberRepository::new(factory.open());
    holder.find_lock_by_username("member1").await.unwrap();

    let waiter = SessionMemberRepository::new(factory.open());
    let err = waiter.find_lock_by_username("member1").await.unwrap_err();
    assert!(matches!(err, Error::LockTimeout(_)));

    waiter.session().rollback().await.unwrap();
    holder.session().rollback().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_optimistic_version_conflict() {
    let _serial = SERIAL.lock().await;
    let db = database().await;
    let factory = db.factory();

    let teams = SessionTeamRepository::new(factory.open());
    let id = teams.save(Team::new("teamA")).await.unwrap().id.unwrap();
    teams.session().commit().await.unwrap();

    let first = SessionTeamRepository::new(factory.open());
    let second = SessionTeamRepository::new(factory.open());
    let mut a = first.get_by_id(id).await.unwrap();
    let mut b = second.get_by_id(id).await.unwrap();
    first.session().commit().await.unwrap();

    b.name = "teamB".to_string();
    second.save(b).await.unwrap();
    second.session().commit().await.unwrap();

    a.name = "teamC".to_string();
    first.save(a).await.unwrap();
    let err = first.flush().await.unwrap_err();
    assert!(matches!(err, Error::StaleData { entity: "Team", .. }));
    first.session().rollback().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_connect_from_app_config() {
    let _serial = SERIAL.lock().await;
    let db = database().await;
    drop(db);

    let mut config = AppConfig::development();
    config.database.url = std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .unwrap();
    config.validate().unwrap();

    let factory = SessionFactory::connect(&config).await.unwrap();
    assert_eq!(factory.store().name(), "postgres");
    assert_eq!(factory.config().lock_timeout_ms, 1000);

    let members = SessionMemberRepository::new(factory.open());
    assert_eq!(members.count().await.unwrap(), 0);
}
