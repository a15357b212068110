mod common;

use common::{executed_ok, harness, DB};
use rusty_inception::backup::derive_location;
use rusty_inception::{InceptionError, RunMode, Severity, Stage};
use std::time::Duration;

const SCENARIO: &str = "insert into t1 values(1,0,1);\
                        update t1 set c1=1 where a=1;\
                        delete from t1 where id=1;";

#[tokio::test]
async fn split_and_audit_keep_one_record_per_statement() -> anyhow::Result<()> {
    let mut h = harness(|_| {})?;
    let script = "use test_inc; insert into t1 values(1); selec oops; -- trailing comment\n\
                  /* c; */ update t1 set c1 = 'a;b' where id = 2;";

    let split = h.engine.split(script)?;
    assert_eq!(split.len(), 4);
    assert!(split.iter().enumerate().all(|(i, r)| r.order_id == i + 1));
    assert!(split.iter().all(|r| r.stage == Stage::Split));
    assert_eq!(split[0].stage_status, "no error");
    assert_eq!(split[2].level, Severity::Error);

    let again: Vec<String> = split.iter().map(|r| r.sql.clone()).collect();
    let resplit = h.engine.split(&again.join(";\n"))?;
    let texts: Vec<&str> = resplit.iter().map(|r| r.sql.as_str()).collect();
    assert_eq!(texts, again.iter().map(String::as_str).collect::<Vec<_>>());

    let audited = h.engine.run(RunMode::Check, script).await?;
    assert_eq!(audited.len(), 4);
    assert!(audited.iter().all(|r| r.stage == Stage::Checked));
    assert_eq!(audited[2].level, Severity::Error);
    assert_eq!(audited[3].level, Severity::Info);
    Ok(())
}

#[tokio::test]
async fn scenario_executes_with_one_backup_row_per_statement() -> anyhow::Result<()> {
    let mut h = harness(|c| c.source.backup = true)?;
    h.setup("create table t1(id int primary key, c1 int, a int)").await?;

    let split = h.engine.split(SCENARIO)?;
    assert_eq!(split.len(), 3);
    assert!(split.iter().all(|r| r.level == Severity::Info && r.error_message.is_empty()));

    let records = h.engine.execute(SCENARIO).await?;
    assert!(records.iter().all(executed_ok), "{records:#?}");
    assert_eq!(
        records.iter().map(|r| r.affected_rows).collect::<Vec<_>>(),
        vec![1, 1, 1]
    );
    let opids: Vec<_> = records.iter().filter_map(|r| r.opid).collect();
    assert_eq!(opids.len(), 3);
    assert!(opids.windows(2).all(|w| w[0] < w[1]));

    let location = derive_location("127.0.0.1", 3306, DB);
    assert!(records
        .iter()
        .all(|r| r.backup_dbname.as_deref() == Some(location.schema.as_str())));

    let rollback = h.engine.rollback_statements(&records).await?;
    assert_eq!(rollback.iter().map(Vec::len).collect::<Vec<_>>(), vec![1, 1, 1]);
    assert!(rollback[0][0].starts_with("DELETE FROM"));
    assert!(rollback[1][0].starts_with("UPDATE"));
    assert!(rollback[2][0].starts_with("INSERT INTO"));

    let stored = h
        .query(&format!(
            "SELECT opid FROM {} WHERE is_sentinel = 0",
            location.qualified()
        ))
        .await?;
    assert_eq!(stored.rows.len(), 3);
    Ok(())
}

#[tokio::test]
async fn deleted_rows_come_back_when_the_undo_script_runs() -> anyhow::Result<()> {
    let mut h = harness(|c| c.source.backup = true)?;
    h.setup(
        "create table t2(id int primary key, name varchar(20), score int);\
         insert into t2 values(1,'a',10),(2,'b',20),(3,'c''s',30),(4,NULL,40),(5,'e',50)",
    )
    .await?;

    let records = h
        .engine
        .execute("delete from t2 where id > 2; update t2 set score = score + 1 where id = 1;")
        .await?;
    assert_eq!(records[0].affected_rows, 3);
    let rollback = h.engine.rollback_statements(&records).await?;
    assert_eq!(rollback[0].len(), 3);
    assert_eq!(h.ids("t2").await?, vec![1, 2]);

    let undo = h.engine.undo_script(&records).await?;
    assert_eq!(undo.len(), 4);
    h.replay(&undo).await?;
    assert_eq!(h.ids("t2").await?, vec![1, 2, 3, 4, 5]);
    let rs = h.query("SELECT name, score FROM t2 ORDER BY id").await?;
    assert_eq!(rs.rows[0][1].as_i64(), Some(10));
    assert_eq!(rs.rows[2][0].to_string(), "c's");
    assert!(rs.rows[3][0].is_null());
    Ok(())
}

#[tokio::test]
async fn failed_statement_rolls_back_and_drains_its_batch() -> anyhow::Result<()> {
    let mut h = harness(|c| {
        c.source.backup = true;
        c.source.tran_batch = 3;
    })?;
    h.setup("create table t3(id int primary key)").await?;
    h.connector.fail_on("values(5)");

    let script: String = (1..=7).map(|i| format!("insert into t3 values({i});")).collect();
    let records = h.engine.execute(&script).await?;
    assert_eq!(records.len(), 7);

    for r in &records[0..3] {
        assert!(executed_ok(r), "{r:#?}");
    }
    for r in &records[3..6] {
        assert_eq!(r.stage_status, "Execute failed", "{r:#?}");
        assert_eq!(r.level, Severity::Error);
        assert_eq!(r.affected_rows, 0);
        assert!(r.opid.is_none());
    }
    assert_eq!(records[3].stage, Stage::Executed);
    assert_eq!(records[5].stage, Stage::Skipped);
    assert!(executed_ok(&records[6]));
    assert_eq!(h.ids("t3").await?, vec![1, 2, 3, 7]);

    // Sentinel rows anchor each committed batch but never show up as rollback.
    let rollback = h.engine.rollback_statements(&records).await?;
    assert_eq!(
        rollback.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![1, 1, 1, 0, 0, 0, 1]
    );
    let location = derive_location("127.0.0.1", 3306, DB);
    let sentinels = h
        .query(&format!(
            "SELECT opid FROM {} WHERE is_sentinel = 1",
            location.qualified()
        ))
        .await?;
    assert_eq!(sentinels.rows.len(), 2);
    Ok(())
}

#[tokio::test]
async fn ddl_gets_a_single_inverse_statement() -> anyhow::Result<()> {
    let mut h = harness(|c| c.source.backup = true)?;
    h.setup("create table t4(id int primary key, c1 int)").await?;

    let records = h
        .engine
        .execute("ALTER TABLE t4 ADD COLUMN c INT; create table t5(id int primary key); drop table t5;")
        .await?;
    assert!(records.iter().all(executed_ok), "{records:#?}");
    let rollback = h.engine.rollback_statements(&records).await?;
    assert_eq!(rollback[0], vec!["ALTER TABLE t4 DROP COLUMN c"]);
    assert_eq!(rollback[1], vec!["DROP TABLE t5"]);
    assert_eq!(rollback[2].len(), 1);
    assert!(rollback[2][0].starts_with("CREATE TABLE t5"));

    let cols = h.query("SHOW COLUMNS FROM t4").await?;
    assert_eq!(cols.rows.len(), 3);
    h.replay(&h.engine.undo_script(&records).await?).await?;
    let cols = h.query("SHOW COLUMNS FROM t4").await?;
    assert_eq!(cols.rows.len(), 2);
    Ok(())
}

#[tokio::test]
async fn error_level_units_never_execute() -> anyhow::Result<()> {
    let mut h = harness(|_| {})?;
    h.setup("create table t6(id int primary key, c1 int); insert into t6 values(1, 1)")
        .await?;

    let records = h
        .engine
        .execute("update t6 set c1 = 2; delete from t6 where id = 1 limit 1; insert into t6 values(2, 2)")
        .await?;
    assert_eq!(records[0].stage, Stage::Skipped);
    assert_eq!(records[0].level, Severity::Error);
    assert_eq!(records[0].affected_rows, 0);
    // Warnings block execution unless ignored.
    assert_eq!(records[1].stage, Stage::Skipped);
    assert_eq!(records[1].level, Severity::Warning);
    assert!(executed_ok(&records[2]));
    assert_eq!(h.ids("t6").await?, vec![1, 2]);
    let rs = h.query("SELECT c1 FROM t6 WHERE id = 1").await?;
    assert_eq!(rs.rows[0][0].as_i64(), Some(1));
    Ok(())
}

#[tokio::test]
async fn refused_capture_leaves_the_target_untouched() -> anyhow::Result<()> {
    let mut h = harness(|c| c.source.backup = true)?;
    h.setup("create table t7(id int primary key, v int); insert into t7 values(1, 1)")
        .await?;

    let records = h
        .engine
        .execute("replace into t7 values(1, 5); update t7 set v = 2 where id = 1")
        .await?;
    assert_eq!(records[0].stage_status, "Backup failed");
    assert_eq!(records[0].level, Severity::Error);
    assert!(executed_ok(&records[1]));
    let rs = h.query("SELECT v FROM t7").await?;
    assert_eq!(rs.rows[0][0].as_i64(), Some(2));
    Ok(())
}

#[tokio::test]
async fn real_row_count_estimates_affected_rows() -> anyhow::Result<()> {
    let mut h = harness(|c| {
        c.source.real_row_count = true;
        c.rules.max_update_rows = 2;
    })?;
    h.setup("create table t8(id int primary key); insert into t8 values(1),(2),(3),(4)")
        .await?;

    let records = h
        .engine
        .audit("delete from t8 where id > 1; delete from t8 where id > 3")
        .await?;
    assert_eq!(records[0].affected_rows, 3);
    assert_eq!(records[0].level, Severity::Warning);
    assert_eq!(records[1].affected_rows, 1);
    assert_eq!(records[1].level, Severity::Info);
    assert_eq!(h.ids("t8").await?, vec![1, 2, 3, 4]);
    Ok(())
}

#[tokio::test]
async fn statistics_accumulate_until_reset() -> anyhow::Result<()> {
    let mut h = harness(|_| {})?;
    h.engine
        .audit("insert into t1 values(1); insert into t1 values(2); alter table t1 add column c int, drop column d")
        .await?;
    h.engine.audit("use test_inc; delete from t1 where id = 1").await?;

    let stats = h.engine.statistics();
    assert_eq!(stats.get("inserting"), Some(&2));
    assert_eq!(stats.get("altertable"), Some(&1));
    assert_eq!(stats.get("addcolumn"), Some(&1));
    assert_eq!(stats.get("dropcolumn"), Some(&1));
    assert_eq!(stats.get("usedb"), Some(&1));
    assert_eq!(stats.get("deleting"), Some(&1));

    h.engine.reset_statistics();
    assert!(h.engine.statistics().values().all(|v| *v == 0));
    Ok(())
}

#[tokio::test]
async fn back_to_back_runs_keep_their_rollback_apart() -> anyhow::Result<()> {
    let mut h = harness(|c| c.source.backup = true)?;
    h.setup("create table p1(id int primary key)").await?;

    let first = h.engine.execute("insert into p1 values(1)").await?;
    let second = h.engine.execute("insert into p1 values(2)").await?;
    assert!(executed_ok(&first[0]) && executed_ok(&second[0]));
    assert_ne!(first[0].opid, second[0].opid);

    let rollback = h.engine.rollback_statements(&second).await?;
    assert_eq!(rollback, vec![vec!["DELETE FROM `test_inc`.`p1` WHERE `id` = 2".to_string()]]);
    let rollback = h.engine.rollback_statements(&first).await?;
    assert_eq!(rollback, vec![vec!["DELETE FROM `test_inc`.`p1` WHERE `id` = 1".to_string()]]);
    Ok(())
}

#[tokio::test]
async fn aliased_and_joined_dml_are_backed_up_per_table() -> anyhow::Result<()> {
    let mut h = harness(|c| c.source.backup = true)?;
    h.setup(
        "create table p2(id int primary key, c1 int);\
         create table p3(id int primary key, c2 int);\
         insert into p2 values(1,1),(2,2),(3,3);\
         insert into p3 values(1,10),(2,20),(3,30)",
    )
    .await?;

    let records = h
        .engine
        .execute(
            "update p2 a set a.c1 = 5 where a.id = 1;\
             update p2 a join p3 b on a.id = b.id set a.c1 = b.c2, b.c2 = 0 where b.id = 2;\
             delete a, b from p2 a join p3 b on a.id = b.id where a.id = 3;",
        )
        .await?;
    assert!(records.iter().all(executed_ok), "{records:#?}");
    assert_eq!(h.ids("p2").await?, vec![1, 2]);
    let rs = h.query("SELECT c1 FROM p2 ORDER BY id").await?;
    assert_eq!(rs.rows[0][0].as_i64(), Some(5));
    assert_eq!(rs.rows[1][0].as_i64(), Some(20));

    let rollback = h.engine.rollback_statements(&records).await?;
    assert_eq!(rollback.iter().map(Vec::len).collect::<Vec<_>>(), vec![1, 2, 2]);

    // Rows are filed under the base table, never the alias.
    let location = derive_location("127.0.0.1", 3306, DB);
    let stored = h
        .query(&format!(
            "SELECT table_name FROM {} WHERE is_sentinel = 0",
            location.qualified()
        ))
        .await?;
    let mut names: Vec<String> = stored.rows.iter().map(|r| r[0].to_string()).collect();
    names.sort();
    assert_eq!(names, vec!["p2", "p2", "p2", "p3", "p3"]);

    h.replay(&h.engine.undo_script(&records).await?).await?;
    assert_eq!(h.ids("p2").await?, vec![1, 2, 3]);
    assert_eq!(h.ids("p3").await?, vec![1, 2, 3]);
    let rs = h.query("SELECT c1 FROM p2 ORDER BY id").await?;
    let c1: Vec<_> = rs.rows.iter().map(|r| r[0].as_i64()).collect();
    assert_eq!(c1, vec![Some(1), Some(2), Some(3)]);
    let rs = h.query("SELECT c2 FROM p3 ORDER BY id").await?;
    let c2: Vec<_> = rs.rows.iter().map(|r| r[0].as_i64()).collect();
    assert_eq!(c2, vec![Some(10), Some(20), Some(30)]);
    Ok(())
}

#[tokio::test]
async fn lost_connection_stops_the_run_and_reports_the_open_batch() -> anyhow::Result<()> {
    let mut h = harness(|c| {
        c.source.backup = true;
        c.source.tran_batch = 3;
    })?;
    h.setup("create table t9(id int primary key)").await?;
    h.connector.lose_connection_on("values(202)");

    let failure = match h
        .engine
        .execute("insert into t9 values(101); insert into t9 values(202); insert into t9 values(303);")
        .await
    {
        Ok(records) => anyhow::bail!("run should stop: {records:#?}"),
        Err(failure) => failure,
    };
    assert!(matches!(failure.error, InceptionError::ConnectionLost(_)));
    assert_eq!(failure.records.len(), 2);
    let first = &failure.records[0];
    assert_eq!(first.stage_status, "Execute failed", "{first:#?}");
    assert_eq!(first.level, Severity::Error);
    assert_eq!(first.affected_rows, 0);
    assert!(first.opid.is_none());
    assert!(first.backup_dbname.is_none());
    assert!(first.error_message.contains("Rolled back"), "{}", first.error_message);
    assert_eq!(failure.records[1].stage_status, "Execute failed");

    h.connector.clear_faults();
    assert!(h.ids("t9").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn timed_out_ddl_keeps_its_rollback_rows() -> anyhow::Result<()> {
    let mut h = harness(|c| {
        c.source.backup = true;
        c.source.backend_timeout_ms = 100;
    })?;
    h.setup("create table t10(id int primary key, c1 int)").await?;
    h.connector.delay_on("add column c2", Duration::from_secs(1));

    let records = h
        .engine
        .execute("alter table t10 add column c2 int; insert into t10(id, c1) values(1, 1)")
        .await?;
    let alter = &records[0];
    assert_eq!(alter.stage_status, "Execute failed", "{alter:#?}");
    assert!(alter.opid.is_some());
    assert!(alter.backup_dbname.is_some());
    assert!(executed_ok(&records[1]), "{:#?}", records[1]);

    // The change landed after the caller gave up; its inverse is still there.
    let cols = h.query("SHOW COLUMNS FROM t10").await?;
    assert_eq!(cols.rows.len(), 3);
    let rollback = h.engine.rollback_statements(&records).await?;
    assert_eq!(rollback[0], vec!["ALTER TABLE t10 DROP COLUMN c2"]);
    Ok(())
}

#[tokio::test]
async fn truncate_is_restored_by_one_statement() -> anyhow::Result<()> {
    let mut h = harness(|c| {
        c.source.backup = true;
        c.rules.enable_truncate = true;
    })?;
    h.setup("create table t11(id int primary key, v int); insert into t11 values(1,10),(2,20),(3,30)")
        .await?;

    let records = h.engine.execute("truncate table t11").await?;
    assert!(executed_ok(&records[0]), "{records:#?}");
    assert!(h.ids("t11").await?.is_empty());

    let rollback = h.engine.rollback_statements(&records).await?;
    assert_eq!(rollback[0].len(), 1);
    assert!(rollback[0][0].starts_with("INSERT INTO"), "{}", rollback[0][0]);
    h.replay(&rollback[0]).await?;
    assert_eq!(h.ids("t11").await?, vec![1, 2, 3]);
    Ok(())
}

#[tokio::test]
async fn ddl_closes_the_open_batch() -> anyhow::Result<()> {
    let mut h = harness(|c| {
        c.source.backup = true;
        c.source.tran_batch = 3;
    })?;
    h.setup("create table t12(id int primary key)").await?;

    let records = h
        .engine
        .execute(
            "insert into t12 values(1); insert into t12 values(2);\
             alter table t12 add column c int; insert into t12(id) values(3);",
        )
        .await?;
    assert!(records.iter().all(executed_ok), "{records:#?}");
    assert_eq!(h.ids("t12").await?, vec![1, 2, 3]);

    let rollback = h.engine.rollback_statements(&records).await?;
    assert_eq!(rollback.iter().map(Vec::len).collect::<Vec<_>>(), vec![1, 1, 1, 1]);
    let location = derive_location("127.0.0.1", 3306, DB);
    let sentinels = h
        .query(&format!(
            "SELECT opid FROM {} WHERE is_sentinel = 1",
            location.qualified()
        ))
        .await?;
    assert_eq!(sentinels.rows.len(), 2);
    Ok(())
}
