//! Service registration and crash cleanup
//!
//! Members of a cluster register under a service type. Each registration is
//! a permanent entry in a per-type list plus an "active" marker that only
//! lives as long as the registering process. Entries without a live marker
//! belong to members that crashed, and any surviving member can reap them.

use super::manager::LockManager;
use crate::common::{CoordError, Result};

/// Callbacks run while the service-type write lock is held
pub trait ServiceCleanup {
    /// Remove state left behind by every member of the type
    fn clean_up_all_services(&mut self) -> Result<()>;

    /// Prepare shared state for a cluster with no live members
    fn cluster_init(&mut self) -> Result<()>;

    /// Remove state left behind by one crashed member
    fn clean_up_service(&mut self, service_name: &str) -> Result<()>;
}

fn service_lock_key(service_type: &str) -> String {
    format!("_SERVICELOCK_{service_type}")
}

fn service_list_key(service_type: &str, index: usize) -> String {
    format!("_SERVICELIST_{service_type}_{index}")
}

fn registered_key(service_type: &str, service_name: &str) -> String {
    format!("_SERVICE_{service_type}_{service_name}")
}

fn active_key(service_type: &str, service_name: &str) -> String {
    format!("_ACTIVE_{service_type}_{service_name}")
}

fn service_data_key(service_type: &str, service_name: &str) -> String {
    format!("_SERVICEDATA_{service_type}_{service_name}")
}

fn service_counter_key(service_type: &str) -> String {
    format!("_SERVICECOUNTER_{service_type}")
}

impl LockManager {
    /// Run `f` under the read or write lock of `service_type`
    fn with_service_lock<T>(
        &mut self,
        service_type: &str,
        write: bool,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let lock = service_lock_key(service_type);
        if write {
            self.enter_write_lock(&lock)?;
        } else {
            self.enter_read_lock(&lock)?;
        }
        let result = f(self);
        let left = if write {
            self.leave_write_lock(&lock)
        } else {
            self.leave_read_lock(&lock)
        };
        match (result, left) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    fn read_service_entry(&self, service_type: &str, index: usize) -> Result<Option<String>> {
        let Some(bytes) = self.read_data(&service_list_key(service_type, index))? else {
            return Ok(None);
        };
        String::from_utf8(bytes).map(Some).map_err(|e| CoordError::General {
            message: format!("service list entry {index} of '{service_type}' is not valid UTF-8"),
            source: Some(Box::new(e)),
        })
    }

    fn write_service_entry(&self, service_type: &str, index: usize, name: Option<&str>) -> Result<()> {
        self.write_data(
            &service_list_key(service_type, index),
            name.map(str::as_bytes),
        )
    }

    fn is_active(&self, service_type: &str, service_name: &str) -> Result<bool> {
        self.backend()
            .check_active(&active_key(service_type, service_name))
    }

    /// Next anonymous name from the persisted per-type counter
    fn allocate_anonymous_name(&self, service_type: &str) -> Result<String> {
        let counter_key = service_counter_key(service_type);
        let next = match self.read_data(&counter_key)? {
            Some(bytes) if bytes.len() == 4 => bincode::deserialize::<u32>(&bytes)?,
            _ => 0,
        };
        let bytes = bincode::serialize(&next.wrapping_add(1))?;
        self.write_data(&counter_key, Some(bytes.as_slice()))?;
        Ok(format!("_ANON_{next}"))
    }

    /// Register a service (anonymously if `service_name` is `None`) and mark it active.
    ///
    /// With a `cleanup`, the first member of an empty or fully crashed
    /// cluster cleans up all services and initializes the cluster; a known
    /// member restarting into a live cluster only cleans up after itself.
    /// Returns the service name.
    pub fn register_service_begin_service_activity(
        &mut self,
        service_type: &str,
        service_name: Option<&str>,
        initial_data: Option<&[u8]>,
        cleanup: Option<&mut dyn ServiceCleanup>,
    ) -> Result<String> {
        self.with_service_lock(service_type, true, |manager| {
            let name = match service_name {
                Some(name) => name.to_string(),
                None => manager.allocate_anonymous_name(service_type)?,
            };
            if manager.is_active(service_type, &name)? {
                return Err(CoordError::general(format!(
                    "Service '{name}' of type '{service_type}' is already active"
                )));
            }

            let mut index = 0;
            let mut found_service = false;
            let mut found_active = false;
            while let Some(entry) = manager.read_service_entry(service_type, index)? {
                if entry == name {
                    found_service = true;
                } else if manager.is_active(service_type, &entry)? {
                    found_active = true;
                }
                index += 1;
            }

            if let Some(cleanup) = cleanup {
                if index == 0 {
                    log::info!("First member of '{service_type}', initializing cluster");
                    cleanup.clean_up_all_services()?;
                    cleanup.cluster_init()?;
                } else if found_service && found_active {
                    log::info!("Cleaning up after previous run of '{name}' ({service_type})");
                    cleanup.clean_up_service(&name)?;
                } else if !found_active {
                    log::info!("No live members of '{service_type}', reinitializing cluster");
                    cleanup.clean_up_all_services()?;
                    cleanup.cluster_init()?;
                    while index > 0 {
                        index -= 1;
                        if let Some(stale) = manager.read_service_entry(service_type, index)? {
                            manager.clear_global_flag(&registered_key(service_type, &stale))?;
                        }
                        manager.write_service_entry(service_type, index, None)?;
                    }
                    found_service = false;
                }
            }

            if !found_service {
                manager.write_service_entry(service_type, index, Some(name.as_str()))?;
                if let Err(e) = manager.set_global_flag(&registered_key(service_type, &name)) {
                    manager.write_service_entry(service_type, index, None)?;
                    return Err(e);
                }
            }

            manager
                .backend()
                .set_active(&active_key(service_type, &name))?;
            manager.write_data(&service_data_key(service_type, &name), initial_data)?;
            log::info!("Service '{name}' of type '{service_type}' is active");
            Ok(name)
        })
    }

    /// Replace the data of an active service
    pub fn update_service_data(
        &mut self,
        service_type: &str,
        service_name: &str,
        data: Option<&[u8]>,
    ) -> Result<()> {
        self.with_service_lock(service_type, true, |manager| {
            if !manager.is_active(service_type, service_name)? {
                return Err(CoordError::general(format!(
                    "Service '{service_name}' of type '{service_type}' is not active"
                )));
            }
            manager.write_data(&service_data_key(service_type, service_name), data)
        })
    }

    /// Data of a service; `None` if inactive, empty if active without data
    pub fn retrieve_service_data(
        &mut self,
        service_type: &str,
        service_name: &str,
    ) -> Result<Option<Vec<u8>>> {
        self.with_service_lock(service_type, false, |manager| {
            if !manager.is_active(service_type, service_name)? {
                return Ok(None);
            }
            Ok(Some(
                manager
                    .read_data(&service_data_key(service_type, service_name))?
                    .unwrap_or_default(),
            ))
        })
    }

    /// Feed every active service's data to `acceptor` until it returns `true`
    pub fn scan_service_data(
        &mut self,
        service_type: &str,
        mut acceptor: impl FnMut(&str, &[u8]) -> Result<bool>,
    ) -> Result<()> {
        self.with_service_lock(service_type, false, |manager| {
            let mut index = 0;
            while let Some(name) = manager.read_service_entry(service_type, index)? {
                index += 1;
                if !manager.is_active(service_type, &name)? {
                    continue;
                }
                let data = manager
                    .read_data(&service_data_key(service_type, &name))?
                    .unwrap_or_default();
                if acceptor(&name, &data)? {
                    break;
                }
            }
            Ok(())
        })
    }

    pub fn count_active_services(&mut self, service_type: &str) -> Result<usize> {
        self.with_service_lock(service_type, false, |manager| {
            let mut index = 0;
            let mut count = 0;
            while let Some(name) = manager.read_service_entry(service_type, index)? {
                if manager.is_active(service_type, &name)? {
                    count += 1;
                }
                index += 1;
            }
            Ok(count)
        })
    }

    pub fn check_service_active(&mut self, service_type: &str, service_name: &str) -> Result<bool> {
        self.with_service_lock(service_type, false, |manager| {
            manager.is_active(service_type, service_name)
        })
    }

    /// Whether a permanent registration exists, active or not
    pub fn check_service_registered(
        &mut self,
        service_type: &str,
        service_name: &str,
    ) -> Result<bool> {
        self.with_service_lock(service_type, false, |manager| {
            manager.check_global_flag(&registered_key(service_type, service_name))
        })
    }

    /// Reap one registered but inactive service.
    ///
    /// Returns `true` when no service needed cleanup, so callers loop until it does.
    pub fn cleanup_inactive_service(
        &mut self,
        service_type: &str,
        cleanup: &mut dyn ServiceCleanup,
    ) -> Result<bool> {
        let reaped = self.with_service_lock(service_type, true, |manager| {
            let mut index = 0;
            let inactive = loop {
                match manager.read_service_entry(service_type, index)? {
                    None => return Ok(None),
                    Some(name) if !manager.is_active(service_type, &name)? => break name,
                    Some(_) => index += 1,
                }
            };

            log::info!("Cleaning up inactive service '{inactive}' of type '{service_type}'");
            cleanup.clean_up_service(&inactive)?;

            let mut last = index;
            while manager.read_service_entry(service_type, last + 1)?.is_some() {
                last += 1;
            }
            manager.clear_global_flag(&registered_key(service_type, &inactive))?;
            if last != index {
                let moved = manager.read_service_entry(service_type, last)?;
                manager.write_service_entry(service_type, index, moved.as_deref())?;
            }
            manager.write_service_entry(service_type, last, None)?;
            Ok(Some(inactive))
        })?;

        if reaped.is_some() {
            self.service().metrics().record_service_cleanup();
        }
        Ok(reaped.is_none())
    }

    /// Sign a service out cleanly; its registration stays
    pub fn end_service_activity(&mut self, service_type: &str, service_name: &str) -> Result<()> {
        self.with_service_lock(service_type, true, |manager| {
            if !manager.is_active(service_type, service_name)? {
                return Err(CoordError::general(format!(
                    "Service '{service_name}' of type '{service_type}' is not active"
                )));
            }
            manager.write_data(&service_data_key(service_type, service_name), None)?;
            manager
                .backend()
                .clear_active(&active_key(service_type, service_name))?;
            log::info!("Service '{service_name}' of type '{service_type}' ended activity");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Config;
    use crate::lock::manager::LockService;
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct RecordingCleanup {
        calls: Vec<String>,
    }

    impl ServiceCleanup for RecordingCleanup {
        fn clean_up_all_services(&mut self) -> Result<()> {
            self.calls.push("all".to_string());
            Ok(())
        }

        fn cluster_init(&mut self) -> Result<()> {
            self.calls.push("init".to_string());
            Ok(())
        }

        fn clean_up_service(&mut self, service_name: &str) -> Result<()> {
            self.calls.push(format!("service:{service_name}"));
            Ok(())
        }
    }

    fn service() -> Arc<LockService> {
        LockService::new(Config::single_process()).unwrap()
    }

    #[test]
    fn test_first_member_initializes_cluster() {
        let service = service();
        let mut manager = service.manager();
        let mut cleanup = RecordingCleanup::default();

        let name = manager
            .register_service_begin_service_activity(
                "agent",
                Some("a1"),
                Some(&b"hello"[..]),
                Some(&mut cleanup as &mut dyn ServiceCleanup),
            )
            .unwrap();
        assert_eq!(name, "a1");
        assert_eq!(cleanup.calls, vec!["all", "init"]);
        assert!(manager.check_service_active("agent", "a1").unwrap());
        assert_eq!(
            manager.retrieve_service_data("agent", "a1").unwrap(),
            Some(b"hello".to_vec())
        );
    }

    #[test]
    fn test_joining_live_cluster_runs_no_cleanup() {
        let service = service();
        let mut manager = service.manager();
        let mut cleanup = RecordingCleanup::default();
        manager
            .register_service_begin_service_activity(
                "agent",
                Some("a1"),
                None,
                Some(&mut cleanup as &mut dyn ServiceCleanup),
            )
            .unwrap();

        let mut cleanup = RecordingCleanup::default();
        manager
            .register_service_begin_service_activity(
                "agent",
                Some("a2"),
                None,
                Some(&mut cleanup as &mut dyn ServiceCleanup),
            )
            .unwrap();
        assert!(cleanup.calls.is_empty());
        assert_eq!(manager.count_active_services("agent").unwrap(), 2);
    }

    #[test]
    fn test_restart_into_live_cluster_cleans_only_itself() {
        let service = service();
        let mut manager = service.manager();
        manager
            .register_service_begin_service_activity("agent", Some("a1"), None, None)
            .unwrap();
        manager
            .register_service_begin_service_activity("agent", Some("a2"), None, None)
            .unwrap();
        manager.end_service_activity("agent", "a1").unwrap();

        let mut cleanup = RecordingCleanup::default();
        manager
            .register_service_begin_service_activity(
                "agent",
                Some("a1"),
                None,
                Some(&mut cleanup as &mut dyn ServiceCleanup),
            )
            .unwrap();
        assert_eq!(cleanup.calls, vec!["service:a1"]);
    }

    #[test]
    fn test_restart_of_dead_cluster_unregisters_everyone() {
        let service = service();
        let mut manager = service.manager();
        for name in ["a1", "a2"] {
            manager
                .register_service_begin_service_activity("agent", Some(name), None, None)
                .unwrap();
            manager.end_service_activity("agent", name).unwrap();
        }

        let mut cleanup = RecordingCleanup::default();
        manager
            .register_service_begin_service_activity(
                "agent",
                Some("a2"),
                None,
                Some(&mut cleanup as &mut dyn ServiceCleanup),
            )
            .unwrap();
        assert_eq!(cleanup.calls, vec!["all", "init"]);
        assert!(!manager.check_service_registered("agent", "a1").unwrap());
        assert!(manager.check_service_registered("agent", "a2").unwrap());
        assert_eq!(manager.count_active_services("agent").unwrap(), 1);
    }

    #[test]
    fn test_anonymous_names_are_unique() {
        let service = service();
        let mut manager = service.manager();
        let first = manager
            .register_service_begin_service_activity("worker", None, None, None)
            .unwrap();
        let second = manager
            .register_service_begin_service_activity("worker", None, None, None)
            .unwrap();
        assert_eq!(first, "_ANON_0");
        assert_eq!(second, "_ANON_1");
    }

    #[test]
    fn test_double_registration_fails() {
        let service = service();
        let mut manager = service.manager();
        manager
            .register_service_begin_service_activity("agent", Some("a1"), None, None)
            .unwrap();
        assert!(
            manager
                .register_service_begin_service_activity("agent", Some("a1"), None, None)
                .is_err()
        );
    }

    #[test]
    fn test_service_data_lifecycle() {
        let service = service();
        let mut manager = service.manager();
        assert!(manager.update_service_data("agent", "a1", Some(&b"x"[..])).is_err());

        manager
            .register_service_begin_service_activity("agent", Some("a1"), None, None)
            .unwrap();
        assert_eq!(
            manager.retrieve_service_data("agent", "a1").unwrap(),
            Some(Vec::new())
        );
        manager
            .update_service_data("agent", "a1", Some(&b"state"[..]))
            .unwrap();
        assert_eq!(
            manager.retrieve_service_data("agent", "a1").unwrap(),
            Some(b"state".to_vec())
        );

        manager.end_service_activity("agent", "a1").unwrap();
        assert_eq!(manager.retrieve_service_data("agent", "a1").unwrap(), None);
        assert!(manager.end_service_activity("agent", "a1").is_err());
        assert!(manager.check_service_registered("agent", "a1").unwrap());
    }

    #[test]
    fn test_scan_stops_when_accepted() {
        let service = service();
        let mut manager = service.manager();
        for (name, data) in [("a1", b"1"), ("a2", b"2"), ("a3", b"3")] {
            manager
                .register_service_begin_service_activity("agent", Some(name), Some(&data[..]), None)
                .unwrap();
        }
        manager.end_service_activity("agent", "a1").unwrap();

        let mut seen = Vec::new();
        manager
            .scan_service_data("agent", |name, data| {
                seen.push((name.to_string(), data.to_vec()));
                Ok(name == "a2")
            })
            .unwrap();
        assert_eq!(seen, vec![("a2".to_string(), b"2".to_vec())]);
    }

    #[test]
    fn test_cleanup_compacts_service_list() {
        let service = service();
        let mut manager = service.manager();
        for name in ["a1", "a2", "a3"] {
            manager
                .register_service_begin_service_activity("agent", Some(name), None, None)
                .unwrap();
        }
        manager.end_service_activity("agent", "a1").unwrap();

        let mut cleanup = RecordingCleanup::default();
        assert!(!manager.cleanup_inactive_service("agent", &mut cleanup).unwrap());
        assert!(manager.cleanup_inactive_service("agent", &mut cleanup).unwrap());
        assert_eq!(cleanup.calls, vec!["service:a1"]);

        assert_eq!(manager.read_service_entry("agent", 0).unwrap().as_deref(), Some("a3"));
        assert_eq!(manager.read_service_entry("agent", 1).unwrap().as_deref(), Some("a2"));
        assert_eq!(manager.read_service_entry("agent", 2).unwrap(), None);
        assert_eq!(service.metrics().snapshot().maintenance.services_cleaned_up, 1);
    }
}
