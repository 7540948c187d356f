//! Integration tests for the member and team repositories
//!
//! Every test runs against a fresh in-memory store; see `postgres_tests.rs`
//! for the same flows against PostgreSQL.

use chrono::Duration as ChronoDuration;
use datajpa_common::{
    retry_with_predicate, telemetry::init_test_tracing, PageRequest, RetryConfig, SessionConfig,
    Sort,
};
use datajpa_domain::{Member, Team, MEMBER_SCHEMA};
use datajpa_infrastructure::{
    query::StatementKind, Arguments, CrudRepository, EntityRepository, Error,
    InvalidationPolicy, MemberRepository, MemoryStore, PlainMemberRepository,
    PlainTeamRepository, QueryDescriptor, SessionFactory, SessionMemberRepository,
    SessionTeamRepository, TeamRepository,
};
use datajpa_testing::{create_members_with_ages, ManualClock};
use std::sync::Arc;
use std::time::Duration;

fn setup() -> (Arc<MemoryStore>, SessionFactory) {
    init_test_tracing();
    let store = MemoryStore::shared();
    let factory = SessionFactory::new(store.clone());
    (store, factory)
}

fn members_of(factory: &SessionFactory) -> SessionMemberRepository {
    SessionMemberRepository::new(factory.open())
}

#[tokio::test]
async fn test_save_and_find_by_id() {
    let (_, factory) = setup();
    let members = members_of(&factory);

    let saved = members.save(Member::new("memberA")).await.unwrap();
    let id = saved.id.expect("identity assigned on save");

    let found = members.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(found.id, saved.id);
    assert_eq!(found.username, "memberA");
    assert_eq!(found, saved);
}

#[tokio::test]
async fn test_basic_crud_counts() {
    let (_, factory) = setup();
    let members = members_of(&factory);

    let member1 = members.save(Member::new("member1")).await.unwrap();
    let member2 = members.save(Member::new("member2")).await.unwrap();

    let found1 = members.get_by_id(member1.id.unwrap()).await.unwrap();
    let found2 = members.get_by_id(member2.id.unwrap()).await.unwrap();
    assert_eq!(found1, member1);
    assert_eq!(found2, member2);

    assert_eq!(members.find_all().await.unwrap().len(), 2);
    assert_eq!(members.count().await.unwrap(), 2);

    members.delete(&member1).await.unwrap();
    members.delete(&member2).await.unwrap();
    assert_eq!(members.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_double_delete_is_not_found() {
    let (_, factory) = setup();
    let members = members_of(&factory);

    let member = members.save(Member::new("member1")).await.unwrap();
    members.session().commit().await.unwrap();

    members.delete(&member).await.unwrap();
    let err = members.delete(&member).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_derived_and_text_queries_agree() {
    let (_, factory) = setup();
    let members = members_of(&factory);

    members.save(Member::with_age("AAA", 10)).await.unwrap();
    members.save(Member::with_age("AAA", 20)).await.unwrap();

    let derived = members
        .find_by_username_and_age_greater_than("AAA", 15)
        .await
        .unwrap();
    assert_eq!(derived.len(), 1);
    assert_eq!(derived[0].username, "AAA");
    assert_eq!(derived[0].age, 20);

    let plain = PlainMemberRepository::new(members.session().clone());
    let written = plain
        .find_by_username_and_age_greater_than("AAA", 15)
        .await
        .unwrap();
    assert_eq!(written, derived);

    let exact = members.find_user("AAA", 10).await.unwrap();
    assert_eq!(exact.len(), 1);
    assert_eq!(exact[0].age, 10);
}

#[tokio::test]
async fn test_single_and_optional_results() {
    let (_, factory) = setup();
    let members = members_of(&factory);

    members.save(Member::with_age("AAA", 10)).await.unwrap();
    members.save(Member::with_age("BBB", 20)).await.unwrap();

    assert_eq!(members.find_list_by_username("AAA").await.unwrap().len(), 1);
    assert_eq!(members.find_member_by_username("AAA").await.unwrap().age, 10);
    assert!(members
        .find_optional_by_username("nobody")
        .await
        .unwrap()
        .is_none());
    assert!(matches!(
        members.find_member_by_username("nobody").await.unwrap_err(),
        Error::NotFound(_)
    ));

    members.save(Member::with_age("AAA", 30)).await.unwrap();
    let err = members.find_optional_by_username("AAA").await.unwrap_err();
    assert!(matches!(err, Error::IncorrectResultSize { expected: 1, actual: 2 }));
}

#[tokio::test]
async fn test_projections_and_collection_parameters() {
    let (_, factory) = setup();
    let session = factory.open();
    let teams = SessionTeamRepository::new(session.clone());
    let members = SessionMemberRepository::new(session);

    let team = teams.save(Team::new("teamA")).await.unwrap();
    members
        .save(Member::with_team("AAA", 10, &team))
        .await
        .unwrap();
    members.save(Member::with_age("BBB", 20)).await.unwrap();

    let mut usernames = members.find_username_list().await.unwrap();
    usernames.sort();
    assert_eq!(usernames, vec!["AAA".to_string(), "BBB".to_string()]);

    // inner join drops members without a team
    let dtos = members.find_member_dto().await.unwrap();
    assert_eq!(dtos.len(), 1);
    assert_eq!(dtos[0].username, "AAA");
    assert_eq!(dtos[0].team_name.as_deref(), Some("teamA"));

    let by_names = members.find_by_names(&["AAA", "BBB"]).await.unwrap();
    assert_eq!(by_names.len(), 2);

    let projected = members.find_projections_by_username("BBB").await.unwrap();
    assert_eq!(projected.len(), 1);
    assert_eq!(projected[0].username, "BBB");
}

#[tokio::test]
async fn test_page_with_total_count() {
    let (_, factory) = setup();
    let members = members_of(&factory);
    members
        .save_all(create_members_with_ages(&[10, 10, 10, 10, 10]))
        .await
        .unwrap();

    let request = PageRequest::of_sorted(0, 3, Sort::desc("username"));
    let page = members.find_by_age(10, &request).await.unwrap();

    let names: Vec<&str> = page.content.iter().map(|m| m.username.as_str()).collect();
    assert_eq!(names, vec!["member5", "member4", "member3"]);
    assert_eq!(page.total_elements, 5);
    assert_eq!(page.number, 0);
    assert_eq!(page.total_pages(), 2);
    assert!(page.is_first());
    assert!(page.has_next());

    let last = members.find_by_age(10, &request.next()).await.unwrap();
    assert_eq!(last.number_of_elements(), 2);
    assert!(last.is_last());
    assert!(last.has_previous());
}

#[tokio::test]
async fn test_page_beyond_last_is_empty_with_total() {
    let (_, factory) = setup();
    let members = members_of(&factory);
    members
        .save_all(create_members_with_ages(&[10, 10, 10]))
        .await
        .unwrap();

    let page = members
        .find_by_age(10, &PageRequest::of(5, 3))
        .await
        .unwrap();
    assert!(page.content.is_empty());
    assert_eq!(page.total_elements, 3);
}

#[tokio::test]
async fn test_page_with_explicit_count_query() {
    let (_, factory) = setup();
    let session = factory.open();
    let teams = SessionTeamRepository::new(session.clone());
    let members = SessionMemberRepository::new(session.clone());

    let team = teams.save(Team::new("teamA")).await.unwrap();
    members
        .save(Member::with_team("member1", 10, &team))
        .await
        .unwrap();
    members
        .save_all(create_members_with_ages(&[10, 10, 20]))
        .await
        .unwrap();
    session.flush().await.unwrap();
    session.reset_statistics().await;

    let page = members
        .find_with_team_by_age(10, &PageRequest::of(0, 2))
        .await
        .unwrap();
    assert_eq!(page.number_of_elements(), 2);
    assert_eq!(page.total_elements, 3);

    let stats = session.statistics().await;
    assert_eq!(stats.query_count(), 2);
    assert_eq!(stats.count_query_count(), 1);
}

#[tokio::test]
async fn test_slice_never_counts() {
    let (_, factory) = setup();
    let members = members_of(&factory);
    members
        .save_all(create_members_with_ages(&[10, 10, 10, 10, 10]))
        .await
        .unwrap();
    members.flush().await.unwrap();
    members.session().reset_statistics().await;

    let request = PageRequest::of_sorted(0, 3, Sort::desc("username"));
    let slice = members.find_slice_by_age(10, &request).await.unwrap();
    assert_eq!(slice.content.len(), 3);
    assert!(slice.has_next());

    let last = members.find_slice_by_age(10, &request.next()).await.unwrap();
    assert_eq!(last.content.len(), 2);
    assert!(!last.has_next());

    let stats = members.session().statistics().await;
    assert_eq!(stats.count_query_count(), 0);
    assert_eq!(stats.count_of(StatementKind::Select), 2);
}

#[tokio::test]
async fn test_page_size_over_maximum_is_rejected() {
    init_test_tracing();
    let factory = SessionFactory::new(MemoryStore::shared()).with_config(SessionConfig {
        max_page_size: 10,
        ..SessionConfig::default()
    });
    let members = members_of(&factory);

    let err = members
        .find_by_age(10, &PageRequest::of(0, 11))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidQuery(_)));
}

#[tokio::test]
async fn test_bulk_update_leaves_managed_entities_stale() {
    let (_, factory) = setup();
    let members = members_of(&factory);
    let saved = members
        .save_all(create_members_with_ages(&[10, 19, 20, 21, 40]))
        .await
        .unwrap();
    let member5 = saved[4].id.unwrap();

    let affected = members
        .bulk_age_plus(20, InvalidationPolicy::Manual)
        .await
        .unwrap();
    assert_eq!(affected, 3);

    // still the pre-statement state
    let stale = members.find_member_by_username("member5").await.unwrap();
    assert_eq!(stale.age, 40);

    members.session().clear().await;
    let fresh = members.get_by_id(member5).await.unwrap();
    assert_eq!(fresh.age, 41);
}

#[tokio::test]
async fn test_bulk_update_with_eviction() {
    let (_, factory) = setup();
    let members = members_of(&factory);
    let saved = members
        .save_all(create_members_with_ages(&[10, 19, 20, 21, 40]))
        .await
        .unwrap();

    let affected = members
        .bulk_age_plus(20, InvalidationPolicy::EvictAffectedType)
        .await
        .unwrap();
    assert_eq!(affected, 3);
    assert!(!members.session().contains::<Member>(saved[4].id.unwrap()).await);

    let fresh = members.find_member_by_username("member5").await.unwrap();
    assert_eq!(fresh.age, 41);
    let untouched = members.find_member_by_username("member2").await.unwrap();
    assert_eq!(untouched.age, 19);
}

#[tokio::test]
async fn test_bulk_through_plain_repository() {
    let (_, factory) = setup();
    let session = factory.open();
    let plain = PlainMemberRepository::new(session.clone());
    for member in create_members_with_ages(&[10, 19, 20, 21, 40]) {
        plain.save(member).await.unwrap();
    }

    let affected = plain
        .bulk_age_plus(20, InvalidationPolicy::ClearSession)
        .await
        .unwrap();
    assert_eq!(affected, 3);
    // 10, 19, 21, 22, 41
    assert_eq!(plain.total_count(21).await.unwrap(), 1);
    assert_eq!(plain.count().await.unwrap(), 5);

    let window = plain.find_by_page(21, 0, 1).await.unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].username, "member3");
    assert_eq!(window[0].age, 21);
}

#[tokio::test]
async fn test_derived_count_exists_and_delete() {
    let (_, factory) = setup();
    let members = members_of(&factory);
    members
        .save_all(create_members_with_ages(&[10, 10, 20]))
        .await
        .unwrap();

    assert_eq!(members.count_by_age(10).await.unwrap(), 2);
    assert!(members.exists_by_username("member3").await.unwrap());
    assert!(!members.exists_by_username("member9").await.unwrap());

    assert_eq!(members.delete_by_username("member1").await.unwrap(), 1);
    assert_eq!(members.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_fetch_join_loads_team_in_one_statement() {
    let (_, factory) = setup();
    let session = factory.open();
    let teams = SessionTeamRepository::new(session.clone());
    let members = SessionMemberRepository::new(session.clone());

    let team_a = teams.save(Team::new("teamA")).await.unwrap();
    let team_b = teams.save(Team::new("teamB")).await.unwrap();
    members
        .save(Member::with_team("member1", 10, &team_a))
        .await
        .unwrap();
    members
        .save(Member::with_team("member2", 10, &team_b))
        .await
        .unwrap();
    members.save(Member::with_age("member3", 10)).await.unwrap();
    session.commit().await.unwrap();
    session.clear().await;
    session.reset_statistics().await;

    let loaded = members.find_member_fetch_join().await.unwrap();
    assert_eq!(loaded.len(), 3);
    let stats = session.statistics().await;
    assert_eq!(stats.query_count(), 1);

    let member1 = loaded.iter().find(|m| m.member.username == "member1").unwrap();
    assert_eq!(member1.team.as_ref().map(|t| t.name.as_str()), Some("teamA"));
    let member3 = loaded.iter().find(|m| m.member.username == "member3").unwrap();
    assert!(member3.team.is_none());

    // teams are managed now, so a lookup needs no statement
    teams.find_by_id(team_b.id.unwrap()).await.unwrap().unwrap();
    assert_eq!(session.statistics().await.query_count(), 1);

    let graph = members.find_entity_graph_by_username("member2").await.unwrap();
    assert_eq!(graph[0].team.as_ref().map(|t| t.name.as_str()), Some("teamB"));
    assert_eq!(members.find_all_with_team().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_team_members_lookup() {
    let (_, factory) = setup();
    let session = factory.open();
    let teams = SessionTeamRepository::new(session.clone());
    let members = SessionMemberRepository::new(session);

    let team = teams.save(Team::new("teamA")).await.unwrap();
    members
        .save(Member::with_team("member1", 10, &team))
        .await
        .unwrap();
    members
        .save(Member::with_team("member2", 20, &team))
        .await
        .unwrap();
    members.save(Member::with_age("member3", 30)).await.unwrap();

    let of_team = teams.members_of(team.id.unwrap()).await.unwrap();
    let names: Vec<&str> = of_team.iter().map(|m| m.username.as_str()).collect();
    assert_eq!(names, vec!["member1", "member2"]);
    assert_eq!(teams.find_by_name("teamA").await.unwrap().unwrap().id, team.id);
}

#[tokio::test]
async fn test_audit_timestamps() {
    init_test_tracing();
    let clock = ManualClock::shared();
    let factory = SessionFactory::new(MemoryStore::shared()).with_clock(clock.clone());
    let members = members_of(&factory);

    let saved = members.save(Member::new("member1")).await.unwrap();
    let created = saved.audit.created_date.unwrap();
    assert_eq!(saved.audit.updated_date, Some(created));

    clock.advance(ChronoDuration::seconds(10));
    let mut changed = saved.clone();
    changed.username = "member2".to_string();
    members.save(changed).await.unwrap();
    members.flush().await.unwrap();
    members.session().clear().await;

    let reloaded = members.get_by_id(saved.id.unwrap()).await.unwrap();
    assert_eq!(reloaded.username, "member2");
    assert_eq!(reloaded.audit.created_date, Some(created));
    assert_eq!(
        reloaded.audit.updated_date,
        Some(created + ChronoDuration::seconds(10))
    );
}

#[tokio::test]
async fn test_read_only_entities_are_not_updated() {
    let (_, factory) = setup();
    let members = members_of(&factory);
    members.save(Member::with_age("member1", 10)).await.unwrap();
    members.flush().await.unwrap();
    members.session().clear().await;
    members.session().reset_statistics().await;

    let mut loaded = members
        .find_read_only_by_username("member1")
        .await
        .unwrap()
        .unwrap();
    loaded.username = "member2".to_string();
    members.save(loaded).await.unwrap();
    members.flush().await.unwrap();

    let stats = members.session().statistics().await;
    assert_eq!(stats.count_of(StatementKind::Update), 0);
    members.session().clear().await;
    assert!(members
        .find_optional_by_username("member1")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_pessimistic_lock_times_out() {
    init_test_tracing();
    let factory = SessionFactory::new(MemoryStore::shared()).with_config(SessionConfig {
        lock_timeout_ms: 50,
        ..SessionConfig::default()
    });

    let setup = members_of(&factory);
    setup.save(Member::with_age("member1", 10)).await.unwrap();
    setup.session().commit().await.unwrap();

    let holder = members_of(&factory);
    let locked = holder.find_lock_by_username("member1").await.unwrap();
    assert_eq!(locked.len(), 1);

    let waiter = members_of(&factory);
    let err = waiter.find_lock_by_username("member1").await.unwrap_err();
    assert!(matches!(err, Error::LockTimeout(_)));
    assert!(err.is_retryable());
    assert!(waiter.session().is_rollback_only().await);

    let no_wait = members_of(&factory);
    let err = no_wait
        .find_lock_by_username_within("member1", Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LockConflict(_)));

    holder.session().commit().await.unwrap();
    let after = members_of(&factory);
    assert_eq!(after.find_lock_by_username("member1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_caller_retries_after_lock_timeout() {
    init_test_tracing();
    let factory = SessionFactory::new(MemoryStore::shared()).with_config(SessionConfig {
        lock_timeout_ms: 20,
        ..SessionConfig::default()
    });
    let setup = members_of(&factory);
    setup.save(Member::with_age("member1", 10)).await.unwrap();
    setup.session().commit().await.unwrap();

    let holder = members_of(&factory);
    holder.find_lock_by_username("member1").await.unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        holder.session().commit().await.unwrap();
    });

    // each attempt needs a fresh session; a failed one is rollback-only
    let locked = retry_with_predicate(
        RetryConfig::exponential(5),
        || {
            let members = members_of(&factory);
            async move { members.find_lock_by_username("member1").await }
        },
        |err: &Error| err.is_retryable(),
    )
    .await
    .unwrap();
    assert_eq!(locked.len(), 1);
    release.await.unwrap();
}

#[tokio::test]
async fn test_poisoned_session_recovers_after_rollback() {
    init_test_tracing();
    let factory = SessionFactory::new(MemoryStore::shared()).with_config(SessionConfig {
        lock_timeout_ms: 10,
        ..SessionConfig::default()
    });
    let setup = members_of(&factory);
    setup.save(Member::with_age("member1", 10)).await.unwrap();
    setup.session().commit().await.unwrap();

    let holder = members_of(&factory);
    holder.find_lock_by_username("member1").await.unwrap();

    let waiter = members_of(&factory);
    waiter.find_lock_by_username("member1").await.unwrap_err();
    let err = waiter.count().await.unwrap_err();
    assert!(matches!(err, Error::TransactionInactive(_)));

    waiter.session().rollback().await.unwrap();
    assert_eq!(waiter.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_optimistic_lock_detects_concurrent_update() {
    let (_, factory) = setup();
    let teams = SessionTeamRepository::new(factory.open());
    let team = teams.save(Team::new("teamA")).await.unwrap();
    teams.session().commit().await.unwrap();
    let id = team.id.unwrap();

    let first = SessionTeamRepository::new(factory.open());
    let second = SessionTeamRepository::new(factory.open());
    let mut from_first = first.get_by_id(id).await.unwrap();
    let mut from_second = second.get_by_id(id).await.unwrap();

    from_second.name = "teamB".to_string();
    second.save(from_second).await.unwrap();
    second.session().commit().await.unwrap();

    from_first.name = "teamC".to_string();
    first.save(from_first).await.unwrap();
    let err = first.flush().await.unwrap_err();
    assert!(matches!(err, Error::StaleData { entity: "Team", .. }));
    assert!(first.session().is_rollback_only().await);
}

#[tokio::test]
async fn test_parameter_mismatch_runs_no_statement() {
    let (_, factory) = setup();
    let members = members_of(&factory);

    let descriptor = QueryDescriptor::derived("findByUsernameAndAgeGreaterThan");
    let err = members
        .list(&descriptor, &Arguments::new().arg("AAA"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ParameterMismatch(_)));

    let request = PageRequest::of(0, 3).with_sort(Sort::asc("nope"));
    let err = members.find_by_age(10, &request).await.unwrap_err();
    assert!(matches!(err, Error::InvalidSortField { .. }));

    assert_eq!(members.session().statistics().await.statement_count(), 0);
    assert!(!members.session().is_rollback_only().await);
}

#[tokio::test]
async fn test_rollback_discards_writes() {
    let (store, factory) = setup();
    let members = members_of(&factory);

    members.save(Member::new("member1")).await.unwrap();
    members.flush().await.unwrap();
    assert_eq!(store.row_count(&MEMBER_SCHEMA), 1);

    members.session().rollback().await.unwrap();
    assert_eq!(store.row_count(&MEMBER_SCHEMA), 0);
    assert!(!members.session().has_staged_writes().await);
}

#[tokio::test]
async fn test_staged_writes_are_invisible_to_other_sessions() {
    let (_, factory) = setup();
    let writer_session = factory.open();
    let writer = PlainTeamRepository::new(writer_session.clone());
    writer.save(Team::new("teamA")).await.unwrap();
    writer.save(Team::new("teamB")).await.unwrap();

    let reader = EntityRepository::<Team>::new(factory.open());
    assert_eq!(reader.count().await.unwrap(), 0);

    writer_session.commit().await.unwrap();
    assert_eq!(reader.count().await.unwrap(), 2);
    assert_eq!(writer.find_all().await.unwrap().len(), 2);
    assert_eq!(writer.count().await.unwrap(), 2);
}
