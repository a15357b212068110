use crate::error::InceptionError;
use crate::model::{Row, TableDef};
use sled::{Batch, IVec};
use std::path::Path;

/// Sled-backed catalog and row storage behind the sandbox backend.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    catalog: sled::Tree,
    data: sled::Tree,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, InceptionError> {
        Self::from_db(sled::open(path)?)
    }

    pub fn temporary() -> Result<Self, InceptionError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, InceptionError> {
        let catalog = db.open_tree("catalog")?;
        let data = db.open_tree("data")?;
        Ok(Self { db, catalog, data })
    }

    pub fn list_databases(&self) -> Result<Vec<String>, InceptionError> {
        let mut out = Vec::new();
        for item in self.catalog.scan_prefix(b"d\0") {
            let (k, _v) = item?;
            out.push(String::from_utf8_lossy(&k[2..]).to_string());
        }
        out.sort();
        Ok(out)
    }

    pub fn database_exists(&self, name: &str) -> Result<bool, InceptionError> {
        Ok(self.catalog.get(Self::db_key(name))?.is_some())
    }

    pub fn create_database(&self, name: &str) -> Result<(), InceptionError> {
        let k = Self::db_key(name);
        if self.catalog.get(&k)?.is_some() {
            return Err(InceptionError::Invalid(format!(
                "Can't create database '{name}'; database exists"
            )));
        }
        self.catalog.insert(k, IVec::from(&b""[..]))?;
        self.catalog.flush()?;
        Ok(())
    }

    pub fn drop_database(&self, name: &str) -> Result<(), InceptionError> {
        let k = Self::db_key(name);
        if self.catalog.get(&k)?.is_none() {
            return Err(InceptionError::NotFound(format!(
                "Can't drop database '{name}'; database doesn't exist"
            )));
        }
        for table in self.list_tables(name)? {
            self.drop_table(name, &table)?;
        }
        self.catalog.remove(k)?;
        self.flush()?;
        Ok(())
    }

    pub fn list_tables(&self, db: &str) -> Result<Vec<String>, InceptionError> {
        let mut out = Vec::new();
        let prefix = Self::table_prefix(db);
        for item in self.catalog.scan_prefix(&prefix) {
            let (k, _v) = item?;
            out.push(String::from_utf8_lossy(&k[prefix.len()..]).to_string());
        }
        out.sort();
        Ok(out)
    }

    pub fn get_table(&self, db: &str, table: &str) -> Result<TableDef, InceptionError> {
        let Some(v) = self.catalog.get(Self::table_key(db, table))? else {
            return Err(InceptionError::NotFound(format!(
                "Table '{db}.{table}' doesn't exist"
            )));
        };
        Ok(bincode::deserialize(&v)?)
    }

    pub fn table_exists(&self, db: &str, table: &str) -> Result<bool, InceptionError> {
        Ok(self.catalog.get(Self::table_key(db, table))?.is_some())
    }

    pub fn create_table(&self, def: &TableDef) -> Result<(), InceptionError> {
        if !self.database_exists(&def.db)? {
            return Err(InceptionError::NotFound(format!(
                "Unknown database '{}'",
                def.db
            )));
        }
        let key = Self::table_key(&def.db, &def.name);
        if self.catalog.get(&key)?.is_some() {
            return Err(InceptionError::Invalid(format!(
                "Table '{}' already exists",
                def.name
            )));
        }
        self.catalog.insert(key, bincode::serialize(def)?)?;
        self.catalog.flush()?;
        Ok(())
    }

    pub fn update_table(&self, def: &TableDef) -> Result<(), InceptionError> {
        let key = Self::table_key(&def.db, &def.name);
        if self.catalog.get(&key)?.is_none() {
            return Err(InceptionError::NotFound(format!(
                "Table '{}.{}' doesn't exist",
                def.db, def.name
            )));
        }
        self.catalog.insert(key, bincode::serialize(def)?)?;
        self.catalog.flush()?;
        Ok(())
    }

    pub fn drop_table(&self, db: &str, table: &str) -> Result<(), InceptionError> {
        let key = Self::table_key(db, table);
        if self.catalog.get(&key)?.is_none() {
            return Err(InceptionError::NotFound(format!(
                "Unknown table '{db}.{table}'"
            )));
        }
        self.catalog.remove(key)?;
        self.catalog.remove(Self::auto_inc_key(db, table))?;
        self.catalog.remove(Self::row_id_key(db, table))?;
        self.clear_rows(db, table)?;
        self.flush()?;
        Ok(())
    }

    pub fn rename_table(
        &self,
        db: &str,
        table: &str,
        new_db: &str,
        new_table: &str,
    ) -> Result<(), InceptionError> {
        let mut def = self.get_table(db, table)?;
        if self.table_exists(new_db, new_table)? {
            return Err(InceptionError::Invalid(format!(
                "Table '{new_table}' already exists"
            )));
        }
        if !self.database_exists(new_db)? {
            return Err(InceptionError::NotFound(format!("Unknown database '{new_db}'")));
        }
        let rows = self.scan_rows(db, table)?;
        let auto_inc = self.auto_increment_next(db, table)?;
        let row_id = self.catalog.get(Self::row_id_key(db, table))?;

        def.db = new_db.to_string();
        def.name = new_table.to_string();
        self.catalog
            .insert(Self::table_key(new_db, new_table), bincode::serialize(&def)?)?;
        if let Some(next) = auto_inc {
            self.bump_auto_increment_next(new_db, new_table, next)?;
        }
        if let Some(v) = row_id {
            self.catalog.insert(Self::row_id_key(new_db, new_table), v)?;
        }
        let changes = rows
            .iter()
            .map(|(id, row)| (new_db, new_table, *id, Some(row)));
        self.apply_row_changes(changes)?;

        self.catalog.remove(Self::table_key(db, table))?;
        self.catalog.remove(Self::auto_inc_key(db, table))?;
        self.catalog.remove(Self::row_id_key(db, table))?;
        self.clear_rows(db, table)?;
        self.flush()?;
        Ok(())
    }

    pub fn truncate_table(&self, db: &str, table: &str) -> Result<(), InceptionError> {
        self.get_table(db, table)?;
        self.clear_rows(db, table)?;
        self.catalog.remove(Self::auto_inc_key(db, table))?;
        self.flush()?;
        Ok(())
    }

    fn clear_rows(&self, db: &str, table: &str) -> Result<(), InceptionError> {
        let row_keys: Vec<Vec<u8>> = self
            .data
            .scan_prefix(Self::row_prefix(db, table))
            .map(|r| r.map(|(k, _)| k.to_vec()))
            .collect::<Result<_, _>>()?;
        let mut batch = Batch::default();
        for rkey in row_keys {
            batch.remove(rkey);
        }
        self.data.apply_batch(batch)?;
        Ok(())
    }

    pub fn apply_row_changes<'a, I>(&self, changes: I) -> Result<(), InceptionError>
    where
        I: IntoIterator<Item = (&'a str, &'a str, i64, Option<&'a Row>)>,
    {
        let mut batch = Batch::default();
        for (db, table, row_id, row) in changes {
            let key = Self::row_key(db, table, row_id);
            match row {
                Some(row) => batch.insert(key, bincode::serialize(row)?),
                None => batch.remove(key),
            }
        }
        self.data.apply_batch(batch)?;
        self.flush()?;
        Ok(())
    }

    /// Next internal row id for a table; ids are never reused.
    pub fn allocate_row_id(&self, db: &str, table: &str) -> Result<i64, InceptionError> {
        let next = self
            .catalog
            .update_and_fetch(Self::row_id_key(db, table), |old| {
                let cur = old.and_then(decode_i64).unwrap_or(0);
                Some(cur.saturating_add(1).to_be_bytes().to_vec())
            })?
            .and_then(|v| decode_i64(&v))
            .ok_or_else(|| InceptionError::Invalid("row id allocation failed".into()))?;
        Ok(next)
    }

    pub fn allocate_auto_increment(&self, db: &str, table: &str) -> Result<i64, InceptionError> {
        let key = Self::auto_inc_key(db, table);
        let next = self
            .catalog
            .update_and_fetch(key, |old| {
                let cur = old.and_then(decode_i64).unwrap_or(1);
                cur.checked_add(1)
                    .map(|n| n.to_be_bytes().to_vec())
                    .or_else(|| Some(i64::MAX.to_be_bytes().to_vec()))
            })?
            .ok_or_else(|| InceptionError::Invalid("auto_increment update failed".into()))?;
        let stored_next = decode_i64(&next)
            .ok_or_else(|| InceptionError::Invalid("corrupt auto_increment value".into()))?;
        let allocated = stored_next.saturating_sub(1);
        if allocated <= 0 {
            return Err(InceptionError::Invalid("auto_increment exhausted".into()));
        }
        Ok(allocated)
    }

    pub fn bump_auto_increment_next(
        &self,
        db: &str,
        table: &str,
        next: i64,
    ) -> Result<(), InceptionError> {
        if next <= 0 {
            return Ok(());
        }
        self.catalog
            .update_and_fetch(Self::auto_inc_key(db, table), |old| {
                let cur = old.and_then(decode_i64).unwrap_or(1);
                Some(cur.max(next).to_be_bytes().to_vec())
            })?;
        Ok(())
    }

    pub fn auto_increment_next(&self, db: &str, table: &str) -> Result<Option<i64>, InceptionError> {
        let Some(v) = self.catalog.get(Self::auto_inc_key(db, table))? else {
            return Ok(None);
        };
        Ok(decode_i64(&v))
    }

    pub fn scan_rows(&self, db: &str, table: &str) -> Result<Vec<(i64, Row)>, InceptionError> {
        let mut out = Vec::new();
        for item in self.data.scan_prefix(Self::row_prefix(db, table)) {
            let (k, v) = item?;
            let row_id = Self::parse_row_id(&k)?;
            let row: Row = bincode::deserialize(&v)?;
            out.push((row_id, row));
        }
        out.sort_by_key(|(id, _)| *id);
        Ok(out)
    }

    pub fn flush(&self) -> Result<(), InceptionError> {
        self.data.flush()?;
        self.catalog.flush()?;
        self.db.flush()?;
        Ok(())
    }

    fn db_key(name: &str) -> Vec<u8> {
        let mut k = Vec::with_capacity(2 + name.len());
        k.extend_from_slice(b"d\0");
        k.extend_from_slice(name.as_bytes());
        k
    }

    fn table_prefix(db: &str) -> Vec<u8> {
        let mut k = Vec::new();
        k.extend_from_slice(b"t\0");
        k.extend_from_slice(db.as_bytes());
        k.push(0);
        k
    }

    fn table_key(db: &str, table: &str) -> Vec<u8> {
        let mut k = Self::table_prefix(db);
        k.extend_from_slice(table.as_bytes());
        k
    }

    fn row_prefix(db: &str, table: &str) -> Vec<u8> {
        let mut k = Vec::new();
        k.extend_from_slice(b"r\0");
        k.extend_from_slice(db.as_bytes());
        k.push(0);
        k.extend_from_slice(table.as_bytes());
        k.push(0);
        k
    }

    fn row_key(db: &str, table: &str, row_id: i64) -> Vec<u8> {
        let mut k = Self::row_prefix(db, table);
        k.extend_from_slice(&row_id.to_be_bytes());
        k
    }

    fn auto_inc_key(db: &str, table: &str) -> Vec<u8> {
        let mut k = Vec::new();
        k.extend_from_slice(b"ai\0");
        k.extend_from_slice(db.as_bytes());
        k.push(0);
        k.extend_from_slice(table.as_bytes());
        k
    }

    fn row_id_key(db: &str, table: &str) -> Vec<u8> {
        let mut k = Vec::new();
        k.extend_from_slice(b"rid\0");
        k.extend_from_slice(db.as_bytes());
        k.push(0);
        k.extend_from_slice(table.as_bytes());
        k
    }

    fn parse_row_id(key: &[u8]) -> Result<i64, InceptionError> {
        if key.len() < 8 {
            return Err(InceptionError::Invalid("corrupt row key".into()));
        }
        decode_i64(&key[key.len() - 8..])
            .ok_or_else(|| InceptionError::Invalid("corrupt row key".into()))
    }
}

fn decode_i64(bytes: &[u8]) -> Option<i64> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some(i64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cell, ColumnDef, SqlType};
    use tempfile::tempdir;

    fn int_column(name: &str) -> ColumnDef {
        ColumnDef {
            name: name.into(),
            ty: SqlType::Int,
            nullable: true,
            definition: format!("`{name}` INT"),
            type_name: "INT".into(),
            default: None,
            auto_increment: false,
        }
    }

    #[test]
    fn rename_moves_rows_and_catalog_entry() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.create_database("d").unwrap();
        store
            .create_table(&TableDef {
                db: "d".into(),
                name: "t".into(),
                columns: vec![int_column("id")],
                indexes: vec![],
                primary_key: vec!["id".into()],
            })
            .unwrap();
        let id = store.allocate_row_id("d", "t").unwrap();
        let row = Row {
            values: vec![Cell::Int(7)],
        };
        store
            .apply_row_changes([("d", "t", id, Some(&row))])
            .unwrap();

        store.rename_table("d", "t", "d", "t2").unwrap();
        assert!(!store.table_exists("d", "t").unwrap());
        assert_eq!(store.get_table("d", "t2").unwrap().name, "t2");
        let rows = store.scan_rows("d", "t2").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.values, vec![Cell::Int(7)]);
        assert!(store.scan_rows("d", "t").unwrap().is_empty());
        assert!(store.allocate_row_id("d", "t2").unwrap() > id);
    }

    #[test]
    fn auto_increment_counts_from_bumped_value() {
        let store = Store::temporary().unwrap();
        store.bump_auto_increment_next("d", "t", 10).unwrap();
        assert_eq!(store.allocate_auto_increment("d", "t").unwrap(), 10);
        assert_eq!(store.allocate_auto_increment("d", "t").unwrap(), 11);
    }

    #[test]
    fn table_prefix_does_not_leak_across_similar_names() {
        let store = Store::temporary().unwrap();
        store.create_database("d").unwrap();
        for name in ["t", "t1"] {
            store
                .create_table(&TableDef {
                    db: "d".into(),
                    name: name.into(),
                    columns: vec![int_column("id")],
                    indexes: vec![],
                    primary_key: vec![],
                })
                .unwrap();
        }
        let row = Row {
            values: vec![Cell::Int(1)],
        };
        store
            .apply_row_changes([("d", "t1", 1, Some(&row))])
            .unwrap();
        assert!(store.scan_rows("d", "t").unwrap().is_empty());
        assert_eq!(store.list_tables("d").unwrap(), vec!["t", "t1"]);
    }
}
