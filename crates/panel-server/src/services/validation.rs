//! Валидация пользовательского ввода: имена, порты, panel_url, IP/CIDR.

use crate::error::AppError;
use std::net::IpAddr;

pub const MAX_NAME_LEN: usize = 64;

/// Имя узла или группы: непустое после trim, не длиннее 64 символов.
pub fn validate_name(name: &str) -> Result<String, AppError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("name обязателен".into()));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(AppError::Validation(format!(
            "name длиннее {MAX_NAME_LEN} символов"
        )));
    }
    Ok(trimmed.to_string())
}

/// Порт в диапазоне 1–65535.
pub fn validate_port(port: i64) -> Result<i32, AppError> {
    if !(1..=65535).contains(&port) {
        return Err(AppError::Validation(format!(
            "port вне диапазона 1–65535: {port}"
        )));
    }
    Ok(port as i32)
}

pub fn validate_address(address: &str) -> Result<String, AppError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("address обязателен".into()));
    }
    if trimmed.contains(char::is_whitespace) || trimmed.contains('/') {
        return Err(AppError::Validation(format!(
            "Некорректный address: {trimmed}"
        )));
    }
    Ok(trimmed.to_string())
}

pub fn validate_weight(weight: i64) -> Result<i32, AppError> {
    if weight < 1 || weight > i32::MAX as i64 {
        return Err(AppError::Validation("weight должен быть положительным".into()));
    }
    Ok(weight as i32)
}

pub fn validate_max_users(max_users: i64) -> Result<i32, AppError> {
    if max_users < 0 || max_users > i32::MAX as i64 {
        return Err(AppError::Validation(
            "max_users не может быть отрицательным".into(),
        ));
    }
    Ok(max_users as i32)
}

/// Валидация panel_url: схема http(s), хост обязателен и должен быть
/// достижим с удалённого узла, то есть не localhost/loopback/0.0.0.0.
pub fn validate_panel_url(url: &str) -> Result<String, AppError> {
    let parsed =
        url::Url::parse(url).map_err(|_| AppError::Validation("Некорректный panel_url".into()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        _ => {
            return Err(AppError::Validation(
                "panel_url должен начинаться с http:// или https://".into(),
            ))
        }
    }

    let ip: Option<IpAddr> = match parsed.host() {
        Some(url::Host::Domain(d)) => {
            // FQDN-форма "localhost." эквивалентна "localhost"
            let domain = d.trim_end_matches('.').to_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") {
                return Err(AppError::Validation(
                    "panel_url не может указывать на localhost: узел не сможет до него достучаться"
                        .into(),
                ));
            }
            None
        }
        Some(url::Host::Ipv4(v4)) => Some(IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => Some(match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }),
        None => return Err(AppError::Validation("panel_url не содержит хост".into())),
    };

    if let Some(ip) = ip {
        if ip.is_loopback() || ip.is_unspecified() {
            return Err(AppError::Validation(
                "panel_url не может указывать на loopback-адрес: узел не сможет до него достучаться"
                    .into(),
            ));
        }
    }

    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

/// Запись белого списка: IP-адрес или CIDR вида addr/prefix.
pub fn validate_ip_entry(entry: &str) -> Result<String, AppError> {
    let entry = entry.trim();
    let invalid = || AppError::Validation(format!("Некорректный IP/CIDR: {entry}"));

    match entry.split_once('/') {
        None => {
            let ip: IpAddr = entry.parse().map_err(|_| invalid())?;
            Ok(ip.to_string())
        }
        Some((addr, prefix)) => {
            let ip: IpAddr = addr.parse().map_err(|_| invalid())?;
            let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
            let max = if ip.is_ipv4() { 32 } else { 128 };
            if prefix > max {
                return Err(invalid());
            }
            Ok(format!("{ip}/{prefix}"))
        }
    }
}

/// Нормализовать белый список: валидировать, убрать дубликаты, отсортировать.
pub fn normalize_ip_whitelist(entries: &[String]) -> Result<Vec<String>, AppError> {
    let mut out = entries
        .iter()
        .map(|e| validate_ip_entry(e))
        .collect::<Result<Vec<_>, _>>()?;
    out.sort();
    out.dedup();
    Ok(out)
}

pub fn normalize_tags(tags: &[String]) -> Result<Vec<String>, AppError> {
    let mut out = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(AppError::Validation("Пустой тег".into()));
        }
        out.push(tag.to_string());
    }
    out.sort();
    out.dedup();
    Ok(out)
}
